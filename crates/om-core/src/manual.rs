//! Servers the user installed themselves and registered by access config.
//!
//! There is no cloud instance behind them: the access config already carries
//! the install result, so they are installed from the moment they are added.
//! Deleting one only forgets it locally.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::install::{InstallMetadata, InstallMetadataSource};
use crate::server::{DeletePolicy, HostBackend, HostInfo, ManagedServer, ServerPolicy};
use crate::store::KeyValueStore;
use crate::trust::CertificateTrustStore;
use crate::types::ServerId;
use crate::{Error, Result};

const STORE_KEY: &str = "manual-servers";
const ACCOUNT: &str = "manual";

/// The `{"apiUrl": ..., "certSha256": ...}` blob printed by the install script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    pub api_url: String,
    pub cert_sha256: String,
}

impl AccessConfig {
    fn validate(self) -> Result<Self> {
        if !self.api_url.starts_with("https://") {
            return Err(Error::InvalidAccessConfig(format!(
                "apiUrl must be an https URL, got {:?}",
                self.api_url
            )));
        }
        if self.cert_sha256.trim().is_empty() {
            return Err(Error::InvalidAccessConfig("certSha256 is empty".into()));
        }
        Ok(self)
    }

    fn metadata(&self) -> InstallMetadata {
        InstallMetadata {
            certificate_fingerprint: Some(self.cert_sha256.clone()),
            api_url: Some(self.api_url.clone()),
            install_error: None,
        }
    }
}

impl FromStr for AccessConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: AccessConfig = serde_json::from_str(s.trim())
            .map_err(|e| Error::InvalidAccessConfig(e.to_string()))?;
        config.validate()
    }
}

/// Persisted list of access configs.
struct ConfigList {
    store: Arc<dyn KeyValueStore>,
    configs: Mutex<Vec<AccessConfig>>,
}

impl ConfigList {
    fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let configs = match store.get(STORE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("decode manual servers: {e}")))?,
            None => Vec::new(),
        };
        Ok(Self {
            store,
            configs: Mutex::new(configs),
        })
    }

    fn snapshot(&self) -> Vec<AccessConfig> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn contains(&self, api_url: &str) -> bool {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| c.api_url == api_url)
    }

    /// Returns `false` when a config with the same API URL is already present.
    fn add(&self, config: &AccessConfig) -> Result<bool> {
        let mut configs = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        if configs.iter().any(|c| c.api_url == config.api_url) {
            return Ok(false);
        }
        configs.push(config.clone());
        self.save(&configs)?;
        Ok(true)
    }

    fn remove(&self, api_url: &str) -> Result<()> {
        let mut configs = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        configs.retain(|c| c.api_url != api_url);
        self.save(&configs)
    }

    fn save(&self, configs: &[AccessConfig]) -> Result<()> {
        let raw = serde_json::to_string(configs)
            .map_err(|e| Error::Store(format!("encode manual servers: {e}")))?;
        self.store.set(STORE_KEY, &raw)
    }
}

struct ManualBackend {
    configs: Arc<ConfigList>,
    config: AccessConfig,
}

#[async_trait]
impl InstallMetadataSource for ManualBackend {
    async fn fetch_install_metadata(&self) -> Result<InstallMetadata> {
        Ok(self.config.metadata())
    }
}

#[async_trait]
impl HostBackend for ManualBackend {
    async fn delete_resources(&self, _policy: DeletePolicy) -> Result<()> {
        self.configs.remove(&self.config.api_url)?;
        info!(api_url = %self.config.api_url, "manual server forgotten");
        Ok(())
    }
}

/// Manually installed servers, persisted in a [`KeyValueStore`].
pub struct ManualServerRepository {
    configs: Arc<ConfigList>,
    trust: Arc<dyn CertificateTrustStore>,
    servers: Mutex<Vec<Arc<ManagedServer>>>,
}

impl ManualServerRepository {
    /// Load the saved access configs and build a server for each.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        trust: Arc<dyn CertificateTrustStore>,
    ) -> Result<Self> {
        let configs = Arc::new(ConfigList::load(store)?);
        let repo = Self {
            configs: configs.clone(),
            trust,
            servers: Mutex::new(Vec::new()),
        };

        let servers = configs
            .snapshot()
            .into_iter()
            .map(|config| repo.wrap(config))
            .collect();
        *repo.servers.lock().unwrap_or_else(PoisonError::into_inner) = servers;
        Ok(repo)
    }

    fn wrap(&self, config: AccessConfig) -> Arc<ManagedServer> {
        let initial = config.metadata();
        ManagedServer::launch(
            ServerId::new(ACCOUNT, &config.api_url),
            config.api_url.clone(),
            HostInfo::default(),
            Arc::new(ManualBackend {
                configs: self.configs.clone(),
                config,
            }),
            initial,
            ServerPolicy::default(),
            self.trust.clone(),
        )
    }

    /// Register a server. Adding an API URL that is already known returns the
    /// existing server.
    pub fn add_server(&self, config: AccessConfig) -> Result<Arc<ManagedServer>> {
        let config = config.validate()?;
        if !self.configs.add(&config)?
            && let Some(existing) =
                self.find(|s| s.management_api_url() == Some(config.api_url.as_str()))
        {
            return Ok(existing);
        }

        let server = self.wrap(config);
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(server.clone());
        Ok(server)
    }

    /// Servers that have not been forgotten.
    pub fn list_servers(&self) -> Vec<Arc<ManagedServer>> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.management_api_url().is_some_and(|url| self.configs.contains(url)))
            .cloned()
            .collect()
    }

    /// Forget the server with `id`.
    pub async fn forget_server(&self, id: &ServerId) -> Result<()> {
        let server = self
            .find(|s| s.id() == id)
            .ok_or_else(|| Error::InvalidId(id.to_string()))?;
        server.host().delete().await?;
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| !Arc::ptr_eq(s, &server));
        Ok(())
    }

    fn find(&self, predicate: impl Fn(&ManagedServer) -> bool) -> Option<Arc<ManagedServer>> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| predicate(s))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::InstallState;
    use crate::store::MemoryStore;
    use crate::trust::MemoryTrustStore;

    const CONFIG: &str =
        r#"{"apiUrl":"https://198.51.100.4:2345/3dFz0pX1","certSha256":"9F8E7D6C5B4A"}"#;

    #[test]
    fn access_config_must_be_https_json() {
        let config: AccessConfig = CONFIG.parse().unwrap();
        assert_eq!(config.api_url, "https://198.51.100.4:2345/3dFz0pX1");

        assert!(matches!(
            r#"{"apiUrl":"http://198.51.100.4","certSha256":"AB"}"#.parse::<AccessConfig>(),
            Err(Error::InvalidAccessConfig(_))
        ));
        assert!(matches!(
            "apiUrl: https://x".parse::<AccessConfig>(),
            Err(Error::InvalidAccessConfig(_))
        ));
    }

    #[tokio::test]
    async fn added_server_is_installed_and_trusted() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let trust = Arc::new(MemoryTrustStore::default());
        let repo = ManualServerRepository::load(store.clone(), trust.clone()).unwrap();

        let server = repo.add_server(CONFIG.parse().unwrap()).unwrap();

        assert!(server.is_install_completed());
        assert_eq!(server.install_state(), InstallState::Success);
        server.wait_on_install().await.unwrap();
        assert_eq!(
            server.id().as_str(),
            "manual:https://198.51.100.4:2345/3dFz0pX1"
        );
        assert_eq!(trust.trusted().len(), 1);
        assert!(store.get(STORE_KEY).unwrap().unwrap().contains("9F8E7D6C5B4A"));
    }

    #[tokio::test]
    async fn adding_the_same_url_twice_keeps_one_server() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let repo =
            ManualServerRepository::load(store, Arc::new(MemoryTrustStore::default())).unwrap();

        let first = repo.add_server(CONFIG.parse().unwrap()).unwrap();
        let second = repo.add_server(CONFIG.parse().unwrap()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(repo.list_servers().len(), 1);
    }

    #[tokio::test]
    async fn saved_servers_reload_and_can_be_forgotten() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let trust: Arc<MemoryTrustStore> = Arc::new(MemoryTrustStore::default());
        ManualServerRepository::load(store.clone(), trust.clone())
            .unwrap()
            .add_server(CONFIG.parse().unwrap())
            .unwrap();

        let reloaded = ManualServerRepository::load(store.clone(), trust).unwrap();
        let servers = reloaded.list_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].is_install_completed());

        let id = servers[0].id().clone();
        reloaded.forget_server(&id).await.unwrap();

        assert!(reloaded.list_servers().is_empty());
        assert!(servers[0].host().is_deleted().await);
        assert_eq!(store.get(STORE_KEY).unwrap().as_deref(), Some("[]"));
        assert!(matches!(
            reloaded.forget_server(&id).await,
            Err(Error::InvalidId(_))
        ));
    }
}
