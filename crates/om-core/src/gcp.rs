use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gce_api::{
    AccessConfig, AttachedDisk, ComputeClient, CreateAddressRequest, DiskInitializeParams,
    Firewall, FirewallRule, InsertInstanceRequest, Instance, Metadata, MetadataItem,
    NetworkInterface, Tags, region_of_zone,
};
use tracing::{debug, info, warn};

use crate::install::{InstallMetadata, InstallMetadataSource};
use crate::server::{DeletePolicy, HostBackend, HostInfo, ManagedServer, ServerPolicy};
use crate::trust::CertificateTrustStore;
use crate::types::{CloudLocation, ServerId};
use crate::{ManagedServerRepository, ProviderName, Result, script};

/// Label key (value `true`), network tag and firewall name of managed instances.
pub const OUTLINE_LABEL: &str = "outline";
const GUEST_ATTRIBUTE_NAMESPACE: &str = "outline";
const MACHINE_TYPE: &str = "e2-micro";
const SOURCE_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts";
const DISK_SIZE_GB: &str = "10";

/// Keep only attributes from the install namespace and fold them into metadata.
pub fn parse_guest_attributes(attributes: &[gce_api::GuestAttribute]) -> InstallMetadata {
    let mut metadata = InstallMetadata::default();
    for attr in attributes
        .iter()
        .filter(|a| a.namespace == GUEST_ATTRIBUTE_NAMESPACE)
    {
        if !metadata.insert(&attr.key, attr.value.clone()) {
            debug!(key = %attr.key, "ignoring unknown guest attribute");
        }
    }
    metadata
}

fn host_info(instance: &Instance) -> HostInfo {
    let zone = instance.zone_name().to_string();
    HostInfo {
        location: Some(CloudLocation {
            display_name: zone.clone(),
            id: zone,
            available: true,
        }),
        monthly_cost: None,
        monthly_outbound_transfer_limit: None,
        created_at: instance
            .creation_timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc)),
    }
}

/// One Compute Engine instance and the static IP named after it.
struct GceInstanceHandle {
    client: ComputeClient,
    zone: String,
    name: String,
}

#[async_trait]
impl InstallMetadataSource for GceInstanceHandle {
    async fn fetch_install_metadata(&self) -> Result<InstallMetadata> {
        match self
            .client
            .get_guest_attributes(&self.zone, &self.name, "outline/")
            .await
        {
            Ok(attributes) => Ok(parse_guest_attributes(&attributes)),
            // Nothing published yet.
            Err(e) if e.is_not_found() => Ok(InstallMetadata::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl HostBackend for GceInstanceHandle {
    async fn delete_resources(&self, policy: DeletePolicy) -> Result<()> {
        let region = region_of_zone(&self.zone);
        policy.tolerate(
            self.client
                .delete_static_ip(region, &self.name)
                .await
                .map_err(Into::into),
        )?;
        policy.tolerate(
            self.client
                .delete_instance(&self.zone, &self.name)
                .await
                .map_err(Into::into),
        )?;
        info!(instance = %self.name, zone = %self.zone, "gcp: instance deleted");
        Ok(())
    }
}

/// Outline servers hosted in one GCP project.
pub struct GcpRepository {
    client: ComputeClient,
    policy: ServerPolicy,
    trust: Arc<dyn CertificateTrustStore>,
    install_script_url: String,
    servers: Mutex<Vec<Arc<ManagedServer>>>,
}

impl GcpRepository {
    pub fn new(
        client: ComputeClient,
        policy: ServerPolicy,
        trust: Arc<dyn CertificateTrustStore>,
        install_script_url: String,
    ) -> Self {
        Self {
            client,
            policy,
            trust,
            install_script_url,
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Open the Outline ports to instances tagged `outline`, once per project.
    async fn ensure_firewall(&self) -> Result<()> {
        match self.client.get_firewall(OUTLINE_LABEL).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let all_ports = |protocol: &str| FirewallRule {
            ip_protocol: protocol.into(),
            ports: Vec::new(),
        };
        let op = self
            .client
            .create_firewall(&Firewall {
                name: OUTLINE_LABEL.into(),
                description: Some("Outline server access".into()),
                target_tags: vec![OUTLINE_LABEL.into()],
                source_ranges: vec!["0.0.0.0/0".into()],
                allowed: vec![all_ports("tcp"), all_ports("udp")],
            })
            .await?;
        self.client.wait_global_operation(&op.name).await?;
        info!(project = %self.client.project(), "gcp: firewall created");
        Ok(())
    }

    /// Promote the instance's ephemeral external IP to a static address so it
    /// survives restarts.
    async fn promote_ephemeral_ip(&self, instance: &Instance) -> Result<()> {
        let Some(ip) = instance.nat_ip() else {
            warn!(instance = %instance.name, "gcp: instance has no external ip to promote");
            return Ok(());
        };

        let region = region_of_zone(instance.zone_name());
        let op = self
            .client
            .create_static_ip(
                region,
                &CreateAddressRequest {
                    name: instance.name.clone(),
                    address: Some(ip.to_string()),
                },
            )
            .await?;
        self.client.wait_region_operation(region, &op.name).await?;
        info!(instance = %instance.name, ip, "gcp: static ip reserved");
        Ok(())
    }

    fn wrap(&self, instance: &Instance) -> Arc<ManagedServer> {
        let zone = instance.zone_name().to_string();
        let handle = GceInstanceHandle {
            client: self.client.clone(),
            zone,
            name: instance.name.clone(),
        };

        ManagedServer::launch(
            ServerId::new(self.client.project(), &instance.id),
            instance
                .description
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| instance.name.clone()),
            host_info(instance),
            Arc::new(handle),
            InstallMetadata::default(),
            self.policy,
            self.trust.clone(),
        )
    }

    fn instance_request(&self, zone: &str, instance_name: &str, name: &str) -> InsertInstanceRequest {
        InsertInstanceRequest {
            name: instance_name.to_string(),
            description: Some(name.to_string()),
            machine_type: format!("zones/{zone}/machineTypes/{MACHINE_TYPE}"),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: true,
                initialize_params: DiskInitializeParams {
                    source_image: SOURCE_IMAGE.into(),
                    disk_size_gb: DISK_SIZE_GB.into(),
                },
            }],
            network_interfaces: vec![NetworkInterface {
                network: Some("global/networks/default".into()),
                access_configs: vec![AccessConfig {
                    kind: Some("ONE_TO_ONE_NAT".into()),
                    name: Some("External NAT".into()),
                    nat_ip: None,
                }],
            }],
            labels: HashMap::from([(OUTLINE_LABEL.to_string(), "true".to_string())]),
            tags: Tags {
                items: vec![OUTLINE_LABEL.into()],
            },
            metadata: Metadata {
                items: vec![
                    MetadataItem {
                        key: "enable-guest-attributes".into(),
                        value: "TRUE".into(),
                    },
                    MetadataItem {
                        key: "startup-script".into(),
                        value: script::gcp_startup_script(&self.install_script_url),
                    },
                ],
            },
        }
    }
}

#[async_trait]
impl ManagedServerRepository for GcpRepository {
    async fn create_server(&self, location: &str, name: &str) -> Result<Arc<ManagedServer>> {
        self.ensure_firewall().await?;

        let instance_name = format!("outline-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let op = self
            .client
            .insert_instance(location, &self.instance_request(location, &instance_name, name))
            .await?;
        self.client.wait_zone_operation(location, &op.name).await?;

        let instance = self.client.get_instance(location, &instance_name).await?;
        info!(instance = %instance_name, zone = %location, "gcp: instance created");

        self.promote_ephemeral_ip(&instance).await?;

        let server = self.wrap(&instance);
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

        let instances = self
            .client
            .list_all_instances(&format!("labels.{OUTLINE_LABEL}=true"))
            .await?;
        let servers: Vec<_> = instances.iter().map(|i| self.wrap(i)).collect();
        info!(count = servers.len(), project = %self.client.project(), "gcp: servers listed");

        *self.servers.lock().unwrap_or_else(PoisonError::into_inner) = servers.clone();
        Ok(servers)
    }

    async fn list_locations(&self) -> Result<Vec<CloudLocation>> {
        let zones = self.client.list_zones().await?;
        Ok(zones
            .into_iter()
            .map(|z| CloudLocation {
                available: z.is_up(),
                display_name: format!("{} ({})", z.name, z.region_name()),
                id: z.name,
            })
            .collect())
    }

    fn provider(&self) -> ProviderName {
        ProviderName::Gcp
    }
}
