//! Install-state reconciliation for freshly created servers.
//!
//! The remote install script never calls back. Instead it publishes its
//! result as provider metadata (droplet tags, guest attributes), and this
//! module polls that metadata until it can decide, exactly once, whether the
//! install succeeded, failed, or became moot because the server was deleted.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::trust::CertificateTrustStore;
use crate::types::ServerId;
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Installation progress of a server. Leaves `Unknown` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Unknown,
    Success,
    Error,
    Deleted,
}

impl InstallState {
    pub fn is_terminal(self) -> bool {
        self != Self::Unknown
    }
}

/// Install result fields as published by the server through provider metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallMetadata {
    pub certificate_fingerprint: Option<String>,
    pub api_url: Option<String>,
    pub install_error: Option<String>,
}

impl InstallMetadata {
    pub fn is_empty(&self) -> bool {
        self.certificate_fingerprint.is_none()
            && self.api_url.is_none()
            && self.install_error.is_none()
    }

    /// Record one published key/value pair. Keys are matched
    /// case-insensitively (`certSha256`/`certsha256`, `apiUrl`/`apiurl`,
    /// `install-error`); unrecognised keys are ignored and reported as `false`.
    pub fn insert(&mut self, key: &str, value: String) -> bool {
        let slot = match key.to_ascii_lowercase().as_str() {
            "certsha256" => &mut self.certificate_fingerprint,
            "apiurl" => &mut self.api_url,
            "install-error" => &mut self.install_error,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Polling cadence and deadline for install detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for InstallPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }
}

/// Why a server ended in [`InstallState::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallFailure {
    /// The install script published an error marker.
    ErrorMarker(String),
    /// No result was published before the deadline.
    Timeout(Duration),
}

impl fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ErrorMarker(detail) => write!(f, "install script reported an error: {detail}"),
            Self::Timeout(after) => write!(f, "no install result after {}s", after.as_secs()),
        }
    }
}

/// Management API location recorded when the install succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementEndpoint {
    pub api_url: String,
    pub certificate_fingerprint: String,
}

/// Source of fresh install metadata for one server.
#[async_trait]
pub trait InstallMetadataSource: Send + Sync + 'static {
    async fn fetch_install_metadata(&self) -> Result<InstallMetadata>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Determination {
    Installed(ManagementEndpoint),
    Failed(InstallFailure),
    Deleted,
}

/// Decide the install outcome from one metadata snapshot.
///
/// An error marker wins over a complete success record; the deadline is
/// only consulted when the metadata itself is inconclusive.
pub(crate) fn evaluate(
    metadata: &InstallMetadata,
    elapsed: Duration,
    timeout: Duration,
) -> Option<Determination> {
    if let Some(detail) = &metadata.install_error {
        return Some(Determination::Failed(InstallFailure::ErrorMarker(detail.clone())));
    }
    if let (Some(fingerprint), Some(api_url)) =
        (&metadata.certificate_fingerprint, &metadata.api_url)
    {
        return Some(Determination::Installed(ManagementEndpoint {
            api_url: api_url.clone(),
            certificate_fingerprint: fingerprint.clone(),
        }));
    }
    if elapsed >= timeout {
        return Some(Determination::Failed(InstallFailure::Timeout(timeout)));
    }
    None
}

struct Shared {
    server_id: ServerId,
    trust: Arc<dyn CertificateTrustStore>,
    state_tx: watch::Sender<InstallState>,
    commit_lock: Mutex<()>,
    endpoint: OnceLock<ManagementEndpoint>,
    failure: OnceLock<InstallFailure>,
}

impl Shared {
    fn state(&self) -> InstallState {
        *self.state_tx.borrow()
    }

    /// The single place a terminal state is written. Returns `false` if a
    /// determination was already made.
    fn commit(&self, determination: Determination) -> bool {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.state();
        if current.is_terminal() {
            debug!(
                server_id = %self.server_id,
                state = ?current,
                ignored = ?determination,
                "install state already determined"
            );
            return false;
        }

        let next = match determination {
            Determination::Installed(endpoint) => {
                self.trust
                    .trust_certificate(&endpoint.api_url, &endpoint.certificate_fingerprint);
                let _ = self.endpoint.set(endpoint);
                InstallState::Success
            }
            Determination::Failed(reason) => {
                warn!(server_id = %self.server_id, %reason, "server install failed");
                let _ = self.failure.set(reason);
                InstallState::Error
            }
            Determination::Deleted => InstallState::Deleted,
        };

        self.state_tx.send_replace(next);
        info!(server_id = %self.server_id, state = ?next, "install state determined");
        true
    }
}

/// Watches one server's installation and broadcasts the outcome.
///
/// Dropping the machine stops any polling still in progress.
pub struct InstallStateMachine {
    shared: Arc<Shared>,
    task: Mutex<Option<AbortHandle>>,
}

impl InstallStateMachine {
    pub fn new(server_id: ServerId, trust: Arc<dyn CertificateTrustStore>) -> Self {
        let (state_tx, _) = watch::channel(InstallState::Unknown);
        Self {
            shared: Arc::new(Shared {
                server_id,
                trust,
                state_tx,
                commit_lock: Mutex::new(()),
                endpoint: OnceLock::new(),
                failure: OnceLock::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Evaluate `initial` immediately, then poll `source` every
    /// `policy.poll_interval` until a determination is made.
    ///
    /// Only spawns a task when `initial` is inconclusive; that requires a
    /// tokio runtime. A second call is ignored.
    pub fn start(
        &self,
        initial: InstallMetadata,
        source: Arc<dyn InstallMetadataSource>,
        policy: InstallPolicy,
    ) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!(server_id = %self.shared.server_id, "install polling already started");
            return;
        }

        let started = Instant::now();
        // Subscribe before evaluating so a concurrent deletion is never missed.
        let state_rx = self.shared.state_tx.subscribe();
        if self.shared.state().is_terminal() {
            return;
        }
        if let Some(determination) = evaluate(&initial, Duration::ZERO, policy.timeout) {
            self.shared.commit(determination);
            return;
        }

        let handle = tokio::spawn(poll(
            self.shared.clone(),
            state_rx,
            initial,
            source,
            policy,
            started,
        ));
        *task = Some(handle.abort_handle());
    }

    /// Resolve once the install succeeded; fail with
    /// [`Error::ServerInstallFailed`] or [`Error::DeletedServer`] otherwise.
    /// Every caller observes the same outcome.
    pub async fn wait_on_install(&self) -> Result<()> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let state = match state_rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => InstallState::Deleted,
        };

        match state {
            InstallState::Success => Ok(()),
            InstallState::Deleted => Err(Error::DeletedServer(self.shared.server_id.clone())),
            InstallState::Error | InstallState::Unknown => Err(Error::ServerInstallFailed(
                self.install_failure()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "install state undetermined".into()),
            )),
        }
    }

    /// `true` once any determination (success, error, or deletion) is made.
    pub fn is_install_completed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn state(&self) -> InstallState {
        self.shared.state()
    }

    pub fn management_endpoint(&self) -> Option<&ManagementEndpoint> {
        self.shared.endpoint.get()
    }

    pub fn install_failure(&self) -> Option<&InstallFailure> {
        self.shared.failure.get()
    }

    /// Callback that forces [`InstallState::Deleted`]. A no-op once the
    /// install has already been determined.
    pub fn deletion_hook(&self) -> Box<dyn Fn() + Send + Sync> {
        let shared = self.shared.clone();
        Box::new(move || {
            shared.commit(Determination::Deleted);
        })
    }

    #[cfg(test)]
    fn transition(&self, determination: Determination) -> bool {
        self.shared.commit(determination)
    }
}

impl Drop for InstallStateMachine {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

async fn poll(
    shared: Arc<Shared>,
    mut state_rx: watch::Receiver<InstallState>,
    mut metadata: InstallMetadata,
    source: Arc<dyn InstallMetadataSource>,
    policy: InstallPolicy,
    started: Instant,
) {
    let deadline = started + policy.timeout;

    loop {
        // The last tick lands on the deadline, never past it.
        let next_tick = (Instant::now() + policy.poll_interval).min(deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            _ = state_rx.changed() => return,
        }

        let fetched = tokio::select! {
            res = tokio::time::timeout_at(deadline, source.fetch_install_metadata()) => res,
            _ = state_rx.changed() => return,
        };
        match fetched {
            Ok(Ok(fresh)) => metadata = fresh,
            Ok(Err(e)) => {
                debug!(server_id = %shared.server_id, error = %e, "install metadata refresh failed, will retry")
            }
            Err(_) => {
                debug!(server_id = %shared.server_id, "install metadata refresh outlasted the install deadline")
            }
        }

        if let Some(determination) = evaluate(&metadata, started.elapsed(), policy.timeout) {
            shared.commit(determination);
            return;
        }
    }
}
