use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::install::{
    InstallFailure, InstallMetadata, InstallMetadataSource, InstallPolicy, InstallState,
    InstallStateMachine, ManagementEndpoint,
};
use crate::trust::CertificateTrustStore;
use crate::types::{CloudLocation, ServerId};
use crate::{Error, Result};

/// What to do when the provider says a resource being deleted is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Treat "not found" as a successful deletion.
    #[default]
    IgnoreNotFound,
    /// Surface "not found" to the caller.
    Strict,
}

impl DeletePolicy {
    /// Apply the policy to the result of one provider deletion call.
    pub fn tolerate<T>(self, result: Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() && self == Self::IgnoreNotFound => {
                warn!(error = %e, "resource already absent, treating as deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl FromStr for DeletePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ignore" => Ok(Self::IgnoreNotFound),
            "fail" => Ok(Self::Strict),
            other => Err(Error::Config(format!(
                "unknown delete policy {other:?} (expected \"ignore\" or \"fail\")"
            ))),
        }
    }
}

/// Behaviour shared by every server a repository creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerPolicy {
    pub install: InstallPolicy,
    pub delete: DeletePolicy,
}

/// Provider-side teardown of the resources backing a server.
#[async_trait]
pub trait HostBackend: Send + Sync + 'static {
    /// Release network resources first, then the compute instance.
    async fn delete_resources(&self, policy: DeletePolicy) -> Result<()>;
}

/// Provider metadata captured when the server object was built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub location: Option<CloudLocation>,
    /// USD per month.
    pub monthly_cost: Option<f64>,
    /// Included outbound transfer per month, in bytes.
    pub monthly_outbound_transfer_limit: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Read-only view of the machine hosting a server, plus its deletion.
pub struct ManagedServerHost {
    info: HostInfo,
    backend: Arc<dyn HostBackend>,
    policy: DeletePolicy,
    deleted: Mutex<bool>,
    on_delete: Box<dyn Fn() + Send + Sync>,
}

impl ManagedServerHost {
    pub fn cloud_location(&self) -> Option<&CloudLocation> {
        self.info.location.as_ref()
    }

    pub fn monthly_cost(&self) -> Option<f64> {
        self.info.monthly_cost
    }

    pub fn monthly_outbound_transfer_limit(&self) -> Option<u64> {
        self.info.monthly_outbound_transfer_limit
    }

    /// When the provider created the machine.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.info.created_at
    }

    /// Delete the cloud resources, then notify the owning server.
    ///
    /// Calling it again after a successful deletion is a no-op.
    pub async fn delete(&self) -> Result<()> {
        let mut deleted = self.deleted.lock().await;
        if *deleted {
            return Ok(());
        }

        self.backend.delete_resources(self.policy).await?;
        *deleted = true;
        (self.on_delete)();
        Ok(())
    }

    pub async fn is_deleted(&self) -> bool {
        *self.deleted.lock().await
    }
}

/// An Outline server owned by this application.
pub struct ManagedServer {
    id: ServerId,
    name: String,
    host: ManagedServerHost,
    install: InstallStateMachine,
}

impl ManagedServer {
    /// Build the server and start watching its installation, evaluating
    /// `initial` before any network call.
    pub(crate) fn launch<B>(
        id: ServerId,
        name: String,
        info: HostInfo,
        backend: Arc<B>,
        initial: InstallMetadata,
        policy: ServerPolicy,
        trust: Arc<dyn CertificateTrustStore>,
    ) -> Arc<Self>
    where
        B: HostBackend + InstallMetadataSource,
    {
        let install = InstallStateMachine::new(id.clone(), trust);
        let host = ManagedServerHost {
            info,
            backend: backend.clone(),
            policy: policy.delete,
            deleted: Mutex::new(false),
            on_delete: install.deletion_hook(),
        };

        install.start(initial, backend, policy.install);
        info!(server_id = %id, state = ?install.state(), "managed server ready");

        Arc::new(Self {
            id,
            name,
            host,
            install,
        })
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &ManagedServerHost {
        &self.host
    }

    pub async fn wait_on_install(&self) -> Result<()> {
        self.install.wait_on_install().await
    }

    /// `true` once success, failure, or deletion has been determined.
    pub fn is_install_completed(&self) -> bool {
        self.install.is_install_completed()
    }

    pub fn install_state(&self) -> InstallState {
        self.install.state()
    }

    pub fn install_failure(&self) -> Option<&InstallFailure> {
        self.install.install_failure()
    }

    pub fn management_endpoint(&self) -> Option<&ManagementEndpoint> {
        self.install.management_endpoint()
    }

    /// Base URL of the management API; set only after a successful install.
    pub fn management_api_url(&self) -> Option<&str> {
        self.management_endpoint().map(|e| e.api_url.as_str())
    }
}
