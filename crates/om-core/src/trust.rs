use std::sync::{Mutex, PoisonError};

use tracing::info;

/// Registers a management endpoint's TLS certificate fingerprint as trusted.
///
/// Called at most once per server, when its installation succeeds.
pub trait CertificateTrustStore: Send + Sync + 'static {
    fn trust_certificate(&self, api_url: &str, fingerprint: &str);
}

/// In-process trust store that records every registration.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    trusted: Mutex<Vec<(String, String)>>,
}

impl MemoryTrustStore {
    /// `(api_url, fingerprint)` pairs in registration order.
    pub fn trusted(&self) -> Vec<(String, String)> {
        self.trusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fingerprint_for(&self, api_url: &str) -> Option<String> {
        self.trusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(url, _)| url == api_url)
            .map(|(_, fp)| fp.clone())
    }
}

impl CertificateTrustStore for MemoryTrustStore {
    fn trust_certificate(&self, api_url: &str, fingerprint: &str) {
        info!(api_url, fingerprint, "trusting management certificate");
        self.trusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((api_url.to_string(), fingerprint.to_string()));
    }
}
