pub mod config;
pub mod digitalocean;
pub mod gcp;
pub mod install;
pub mod manual;
pub mod script;
pub mod server;
pub mod store;
pub mod trust;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use config::ManagerConfig;
use server::ManagedServer;
use trust::CertificateTrustStore;
use types::{CloudLocation, ServerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("digitalocean error: {0}")]
    DigitalOcean(#[from] do_api::Error),

    #[error("gcp error: {0}")]
    Gcp(#[from] gce_api::Error),

    #[error("server install failed: {0}")]
    ServerInstallFailed(String),

    #[error("server {0} was deleted")]
    DeletedServer(ServerId),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid access config: {0}")]
    InvalidAccessConfig(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// The provider reported the addressed resource as absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::DigitalOcean(e) => e.is_not_found(),
            Self::Gcp(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cloud providers that can host an Outline server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    DigitalOcean,
    Gcp,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DigitalOcean => "digitalocean",
            Self::Gcp => "gcp",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "digitalocean" | "do" => Ok(Self::DigitalOcean),
            "gcp" | "gce" => Ok(Self::Gcp),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Per-provider factory and cache of managed servers.
///
/// Servers are returned as soon as the cloud instance exists; install
/// completion is observed through [`ManagedServer::wait_on_install`].
#[async_trait]
pub trait ManagedServerRepository: Send + Sync + 'static {
    /// Create the cloud resources for a new server in `location` and start
    /// watching its installation. Does not wait for the install to finish.
    async fn create_server(&self, location: &str, name: &str) -> Result<Arc<ManagedServer>>;

    /// List Outline servers. With `fetch_from_host == false` the last fetched
    /// list is returned without any network call.
    async fn list_servers(&self, fetch_from_host: bool) -> Result<Vec<Arc<ManagedServer>>>;

    /// Locations where a server can be created.
    async fn list_locations(&self) -> Result<Vec<CloudLocation>>;

    /// Provider identifier.
    fn provider(&self) -> ProviderName;
}

/// Registry of the repositories whose credentials are configured.
#[derive(Clone, Default)]
pub struct RepositoryRegistry {
    repositories: HashMap<ProviderName, Arc<dyn ManagedServerRepository>>,
}

impl RepositoryRegistry {
    /// Look up a repository by provider.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn ManagedServerRepository>> {
        self.repositories.get(&name)
    }

    /// List the providers that are available.
    pub fn available(&self) -> Vec<ProviderName> {
        self.repositories.keys().copied().collect()
    }

    /// Returns `true` if no cloud provider is configured.
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

/// Build a repository for every provider whose credentials are configured.
///
/// Providers without credentials are skipped with a debug log. An empty
/// registry is not an error: manually-configured servers need no provider.
pub fn build_repositories(
    config: &ManagerConfig,
    trust: Arc<dyn CertificateTrustStore>,
) -> RepositoryRegistry {
    let mut repositories: HashMap<ProviderName, Arc<dyn ManagedServerRepository>> =
        HashMap::new();
    let policy = config.server_policy();

    match &config.digitalocean_token {
        Some(token) => {
            let repo = digitalocean::DigitalOceanRepository::new(
                do_api::DigitalOceanClient::new(token.clone()),
                policy,
                trust.clone(),
                config.install_script_url.clone(),
            );
            tracing::info!("registered DigitalOcean repository");
            repositories.insert(ProviderName::DigitalOcean, Arc::new(repo));
        }
        None => tracing::debug!("skipping DigitalOcean repository: DIGITALOCEAN_TOKEN not set"),
    }

    match &config.gcp {
        Some(gcp) => {
            let repo = gcp::GcpRepository::new(
                gce_api::ComputeClient::new(gcp.access_token.clone(), gcp.project_id.clone()),
                policy,
                trust,
                config.install_script_url.clone(),
            );
            tracing::info!(project = %gcp.project_id, "registered GCP repository");
            repositories.insert(ProviderName::Gcp, Arc::new(repo));
        }
        None => tracing::debug!("skipping GCP repository: GCP credentials not set"),
    }

    RepositoryRegistry { repositories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::MemoryTrustStore;

    #[test]
    fn provider_names_round_trip_through_strings() {
        for name in [ProviderName::DigitalOcean, ProviderName::Gcp] {
            assert_eq!(name.as_str().parse::<ProviderName>().unwrap(), name);
        }
        assert!(matches!(
            "lightsail".parse::<ProviderName>(),
            Err(Error::UnknownProvider(p)) if p == "lightsail"
        ));
    }

    #[test]
    fn registry_only_contains_configured_providers() {
        let config = ManagerConfig::from_lookup(|key| match key {
            "DIGITALOCEAN_TOKEN" => Some("do-token".into()),
            _ => None,
        })
        .unwrap();

        let registry = build_repositories(&config, Arc::new(MemoryTrustStore::default()));
        assert_eq!(registry.available(), vec![ProviderName::DigitalOcean]);
        assert!(registry.get(ProviderName::Gcp).is_none());
        assert_eq!(
            registry.get(ProviderName::DigitalOcean).unwrap().provider(),
            ProviderName::DigitalOcean
        );
    }

    #[test]
    fn empty_registry_is_allowed() {
        let config = ManagerConfig::from_lookup(|_| None).unwrap();
        let registry = build_repositories(&config, Arc::new(MemoryTrustStore::default()));
        assert!(registry.is_empty());
    }
}
