use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use do_api::{CreateDropletRequest, DigitalOceanClient, Droplet};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::install::{InstallMetadata, InstallMetadataSource};
use crate::server::{DeletePolicy, HostBackend, HostInfo, ManagedServer, ServerPolicy};
use crate::trust::CertificateTrustStore;
use crate::types::{CloudLocation, ServerId};
use crate::{ManagedServerRepository, ProviderName, Result, script};

/// Tag carried by every droplet this application creates.
pub const OUTLINE_TAG: &str = "outline";
const KV_TAG_PREFIX: &str = "kv:";
const DROPLET_SIZE: &str = "s-1vcpu-1gb";
const DROPLET_IMAGE: &str = "ubuntu-22-04-x64";
const BYTES_PER_TERABYTE: f64 = 1_000_000_000_000.0;

/// Decode `kv:<key>:<hex>` droplet tags into install metadata.
///
/// The prefix and key are case-insensitive. Values that are not valid
/// hex-encoded UTF-8 are skipped.
pub fn parse_droplet_tags<'a>(tags: impl IntoIterator<Item = &'a String>) -> InstallMetadata {
    let mut metadata = InstallMetadata::default();
    for tag in tags {
        let Some(kv) = tag
            .get(..KV_TAG_PREFIX.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(KV_TAG_PREFIX))
            .map(|_| &tag[KV_TAG_PREFIX.len()..])
        else {
            continue;
        };
        let Some((key, hex_value)) = kv.split_once(':') else {
            continue;
        };

        match hex::decode(hex_value).map(String::from_utf8) {
            Ok(Ok(value)) => {
                metadata.insert(key, value);
            }
            _ => warn!(tag = %tag, "skipping droplet tag with undecodable value"),
        }
    }
    metadata
}

fn host_info(droplet: &Droplet) -> HostInfo {
    HostInfo {
        location: Some(CloudLocation {
            id: droplet.region.slug.clone(),
            display_name: droplet.region.name.clone(),
            available: droplet.region.available,
        }),
        monthly_cost: Some(droplet.size.price_monthly),
        monthly_outbound_transfer_limit: Some((droplet.size.transfer * BYTES_PER_TERABYTE) as u64),
        created_at: droplet.created_at,
    }
}

/// One droplet, as seen by its install state machine and its host.
struct DropletHandle {
    client: DigitalOceanClient,
    droplet_id: u64,
}

#[async_trait]
impl InstallMetadataSource for DropletHandle {
    async fn fetch_install_metadata(&self) -> Result<InstallMetadata> {
        let droplet = self.client.get_droplet(self.droplet_id).await?;
        Ok(parse_droplet_tags(&droplet.tags))
    }
}

#[async_trait]
impl HostBackend for DropletHandle {
    async fn delete_resources(&self, policy: DeletePolicy) -> Result<()> {
        policy.tolerate(
            self.client
                .delete_droplet(self.droplet_id)
                .await
                .map_err(Into::into),
        )?;
        info!(droplet_id = self.droplet_id, "digitalocean: droplet deleted");
        Ok(())
    }
}

/// Outline servers hosted on one DigitalOcean account.
pub struct DigitalOceanRepository {
    client: DigitalOceanClient,
    policy: ServerPolicy,
    trust: Arc<dyn CertificateTrustStore>,
    install_script_url: String,
    account_id: OnceCell<String>,
    servers: Mutex<Vec<Arc<ManagedServer>>>,
}

impl DigitalOceanRepository {
    pub fn new(
        client: DigitalOceanClient,
        policy: ServerPolicy,
        trust: Arc<dyn CertificateTrustStore>,
        install_script_url: String,
    ) -> Self {
        Self {
            client,
            policy,
            trust,
            install_script_url,
            account_id: OnceCell::new(),
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Account UUID, fetched once on first use.
    pub async fn account_id(&self) -> Result<&str> {
        let id = self
            .account_id
            .get_or_try_init(|| async {
                let account = self.client.get_account().await?;
                info!(account_id = %account.uuid, "digitalocean: account resolved");
                Ok::<_, crate::Error>(account.uuid)
            })
            .await?;
        Ok(id)
    }

    fn wrap(&self, account_id: &str, droplet: &Droplet) -> Arc<ManagedServer> {
        ManagedServer::launch(
            ServerId::new(account_id, &droplet.id.to_string()),
            droplet.name.clone(),
            host_info(droplet),
            Arc::new(DropletHandle {
                client: self.client.clone(),
                droplet_id: droplet.id,
            }),
            parse_droplet_tags(&droplet.tags),
            self.policy,
            self.trust.clone(),
        )
    }
}

#[async_trait]
impl ManagedServerRepository for DigitalOceanRepository {
    async fn create_server(&self, location: &str, name: &str) -> Result<Arc<ManagedServer>> {
        let account_id = self.account_id().await?.to_string();
        let user_data =
            script::digitalocean_user_data(self.client.token(), &self.install_script_url);

        let droplet = self
            .client
            .create_droplet(&CreateDropletRequest {
                name: name.to_string(),
                region: location.to_string(),
                size: DROPLET_SIZE.into(),
                image: DROPLET_IMAGE.into(),
                ssh_keys: Vec::new(),
                user_data: Some(user_data),
                tags: vec![OUTLINE_TAG.into()],
                ipv6: true,
            })
            .await?;

        info!(droplet_id = droplet.id, region = %location, "digitalocean: droplet created");

        let server = self.wrap(&account_id, &droplet);
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(server.clone());
        Ok(server)
    }

    async fn list_servers(&self, fetch_from_host: bool) -> Result<Vec<Arc<ManagedServer>>> {
        if !fetch_from_host {
            return Ok(self
                .servers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone());
        }

        let account_id = self.account_id().await?.to_string();
        let droplets = self.client.list_droplets_by_tag(OUTLINE_TAG).await?;
        let servers: Vec<_> = droplets
            .iter()
            .map(|droplet| self.wrap(&account_id, droplet))
            .collect();
        info!(count = servers.len(), "digitalocean: servers listed");

        *self.servers.lock().unwrap_or_else(PoisonError::into_inner) = servers.clone();
        Ok(servers)
    }

    async fn list_locations(&self) -> Result<Vec<CloudLocation>> {
        let regions = self.client.list_regions().await?;
        Ok(regions
            .into_iter()
            .map(|r| CloudLocation {
                available: r.available && r.sizes.iter().any(|s| s == DROPLET_SIZE),
                id: r.slug,
                display_name: r.name,
            })
            .collect())
    }

    fn provider(&self) -> ProviderName {
        ProviderName::DigitalOcean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::{InstallPolicy, InstallState};
    use crate::trust::MemoryTrustStore;
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;

    const API_URL: &str = "https://203.0.113.7:4431/kXkzRYuCJZ6AEoKY";
    const FINGERPRINT: &str = "C1A7B4F09D7E0C64F3A9A40D30A82F3A";

    fn kv_tag(key: &str, value: &str) -> String {
        format!("kv:{key}:{}", hex::encode(value))
    }

    fn droplet_json(id: u64, tags: &[String]) -> String {
        serde_json::json!({
            "id": id,
            "name": format!("outline-{id}"),
            "status": "active",
            "tags": tags,
            "region": {"slug": "ams3", "name": "Amsterdam 3", "available": true},
            "size": {"slug": "s-1vcpu-1gb", "price_monthly": 6.0, "transfer": 1.0},
            "networks": {"v4": []},
            "created_at": "2024-05-01T10:00:00Z"
        })
        .to_string()
    }

    fn installed_tags() -> Vec<String> {
        vec![
            OUTLINE_TAG.to_string(),
            kv_tag("certsha256", FINGERPRINT),
            kv_tag("apiurl", API_URL),
        ]
    }

    async fn repository(
        server: &mut ServerGuard,
        delete: DeletePolicy,
    ) -> (DigitalOceanRepository, Arc<MemoryTrustStore>) {
        server
            .mock("GET", "/account")
            .with_status(200)
            .with_body(r#"{"account":{"uuid":"acct-uuid","email":"ops@example.com"}}"#)
            .create_async()
            .await;

        let trust = Arc::new(MemoryTrustStore::default());
        let repo = DigitalOceanRepository::new(
            DigitalOceanClient::with_base_url("dop_v1_test", server.url()),
            ServerPolicy {
                install: InstallPolicy {
                    poll_interval: Duration::from_millis(20),
                    timeout: Duration::from_secs(5),
                },
                delete,
            },
            trust.clone(),
            "https://example.com/install.sh".into(),
        );
        (repo, trust)
    }

    #[test]
    fn tags_decode_into_install_metadata() {
        let tags = vec![
            "outline".to_string(),
            "KV:ApiUrl:".to_string() + &hex::encode(API_URL),
            kv_tag("certsha256", FINGERPRINT),
            "kv:install-error:zz".to_string(),
            "kv:no-separator".to_string(),
        ];

        let metadata = parse_droplet_tags(&tags);
        assert_eq!(metadata.api_url.as_deref(), Some(API_URL));
        assert_eq!(metadata.certificate_fingerprint.as_deref(), Some(FINGERPRINT));
        assert!(metadata.install_error.is_none());
    }

    #[test]
    fn untagged_droplet_has_no_metadata() {
        assert!(parse_droplet_tags(&vec![OUTLINE_TAG.to_string()]).is_empty());
    }

    #[tokio::test]
    async fn created_droplet_installs_after_tags_appear() {
        let mut server = Server::new_async().await;
        let (repo, trust) = repository(&mut server, DeletePolicy::default()).await;

        let create = server
            .mock("POST", "/droplets")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "name": "my-server",
                "region": "ams3",
                "tags": ["outline"],
            })))
            .with_status(202)
            .with_body(format!(r#"{{"droplet": {}}}"#, droplet_json(77, &[OUTLINE_TAG.into()])))
            .expect(1)
            .create_async()
            .await;
        let _get = server
            .mock("GET", "/droplets/77")
            .with_status(200)
            .with_body(format!(r#"{{"droplet": {}}}"#, droplet_json(77, &installed_tags())))
            .create_async()
            .await;

        let created = repo.create_server("ams3", "my-server").await.unwrap();
        assert_eq!(created.id().as_str(), "acct-uuid:77");
        assert!(!created.is_install_completed());

        created.wait_on_install().await.unwrap();

        create.assert_async().await;
        assert_eq!(created.install_state(), InstallState::Success);
        assert_eq!(created.management_api_url(), Some(API_URL));
        assert_eq!(trust.fingerprint_for(API_URL).as_deref(), Some(FINGERPRINT));
        assert_eq!(created.host().monthly_cost(), Some(6.0));
        assert_eq!(
            created.host().created_at().map(|t| t.to_rfc3339()).as_deref(),
            Some("2024-05-01T10:00:00+00:00")
        );
        assert_eq!(
            created.host().monthly_outbound_transfer_limit(),
            Some(1_000_000_000_000)
        );
    }

    #[tokio::test]
    async fn error_tag_fails_install() {
        let mut server = Server::new_async().await;
        let (repo, trust) = repository(&mut server, DeletePolicy::default()).await;

        let mut tags = installed_tags();
        tags.push(kv_tag("install-error", "true"));
        server
            .mock("GET", "/droplets")
            .match_query(Matcher::UrlEncoded("tag_name".into(), "outline".into()))
            .with_status(200)
            .with_body(format!(r#"{{"droplets": [{}]}}"#, droplet_json(5, &tags)))
            .create_async()
            .await;

        let servers = repo.list_servers(true).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert!(matches!(
            servers[0].wait_on_install().await,
            Err(crate::Error::ServerInstallFailed(_))
        ));
        assert!(trust.trusted().is_empty());
    }

    #[tokio::test]
    async fn cached_listing_makes_no_network_calls() {
        let mut server = Server::new_async().await;
        let (repo, _trust) = repository(&mut server, DeletePolicy::default()).await;

        assert!(repo.list_servers(false).await.unwrap().is_empty());

        let list = server
            .mock("GET", "/droplets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"droplets": [{}, {}]}}"#,
                droplet_json(1, &installed_tags()),
                droplet_json(2, &installed_tags())
            ))
            .expect(1)
            .create_async()
            .await;

        let fetched = repo.list_servers(true).await.unwrap();
        let cached = repo.list_servers(false).await.unwrap();

        list.assert_async().await;
        assert_eq!(fetched.len(), 2);
        assert_eq!(cached.len(), 2);
        assert!(fetched.iter().zip(&cached).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert!(cached.iter().all(|s| s.is_install_completed()));
    }

    #[tokio::test]
    async fn refetch_replaces_server_objects() {
        let mut server = Server::new_async().await;
        let (repo, _trust) = repository(&mut server, DeletePolicy::default()).await;
        server
            .mock("GET", "/droplets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(r#"{{"droplets": [{}]}}"#, droplet_json(1, &installed_tags())))
            .expect(2)
            .create_async()
            .await;

        let first = repo.list_servers(true).await.unwrap();
        let second = repo.list_servers(true).await.unwrap();

        assert_eq!(first[0].id(), second[0].id());
        assert!(!Arc::ptr_eq(&first[0], &second[0]));
    }

    #[tokio::test]
    async fn deleting_a_gone_droplet_follows_policy() {
        let mut server = Server::new_async().await;
        let (lenient, _) = repository(&mut server, DeletePolicy::IgnoreNotFound).await;
        let (strict, _) = repository(&mut server, DeletePolicy::Strict).await;
        server
            .mock("GET", "/droplets")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(r#"{{"droplets": [{}]}}"#, droplet_json(9, &[OUTLINE_TAG.into()])))
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/droplets/9")
            .with_status(404)
            .with_body(r#"{"id":"not_found"}"#)
            .expect(2)
            .create_async()
            .await;

        let strict_server = strict.list_servers(true).await.unwrap().remove(0);
        assert!(strict_server.host().delete().await.unwrap_err().is_not_found());
        assert!(!strict_server.is_install_completed());

        let lenient_server = lenient.list_servers(true).await.unwrap().remove(0);
        lenient_server.host().delete().await.unwrap();
        lenient_server.host().delete().await.unwrap();
        assert_eq!(lenient_server.install_state(), InstallState::Deleted);
        assert!(matches!(
            lenient_server.wait_on_install().await,
            Err(crate::Error::DeletedServer(_))
        ));

        delete.assert_async().await;
    }

    #[tokio::test]
    async fn locations_require_the_droplet_size() {
        let mut server = Server::new_async().await;
        let (repo, _trust) = repository(&mut server, DeletePolicy::default()).await;
        server
            .mock("GET", "/regions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"regions":[
                    {"slug":"ams3","name":"Amsterdam 3","available":true,"sizes":["s-1vcpu-1gb"]},
                    {"slug":"nyc1","name":"New York 1","available":true,"sizes":["s-8vcpu-16gb"]},
                    {"slug":"sfo1","name":"San Francisco 1","available":false,"sizes":[]}
                ]}"#,
            )
            .create_async()
            .await;

        let locations = repo.list_locations().await.unwrap();
        let available: Vec<_> = locations
            .iter()
            .filter(|l| l.available)
            .map(|l| l.id.as_str())
            .collect();
        assert_eq!(locations.len(), 3);
        assert_eq!(available, vec!["ams3"]);
    }
}
