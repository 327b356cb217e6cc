use std::path::PathBuf;
use std::time::Duration;

use crate::install::InstallPolicy;
use crate::server::{DeletePolicy, ServerPolicy};
use crate::{Error, Result};

pub const DEFAULT_INSTALL_SCRIPT_URL: &str = "https://raw.githubusercontent.com/Jigsaw-Code/outline-apps/master/server_manager/install_scripts/install_server.sh";

/// Credentials for one GCP project.
#[derive(Debug, Clone)]
pub struct GcpCredentials {
    pub access_token: String,
    pub project_id: String,
}

/// Everything the manager needs, gathered once at startup.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub digitalocean_token: Option<String>,
    pub gcp: Option<GcpCredentials>,
    pub install: InstallPolicy,
    pub delete_policy: DeletePolicy,
    pub state_file: PathBuf,
    pub install_script_url: String,
}

impl ManagerConfig {
    /// Load from env vars (and `.env` if present):
    ///
    /// - `DIGITALOCEAN_TOKEN` (optional)
    /// - `GCP_ACCESS_TOKEN` + `GCP_PROJECT_ID` (optional, both or neither)
    /// - `OUTLINE_INSTALL_POLL_INTERVAL_SECS` (default: 3)
    /// - `OUTLINE_INSTALL_TIMEOUT_SECS` (default: 300)
    /// - `OUTLINE_DELETE_NOT_FOUND` (`ignore` | `fail`, default: `ignore`)
    /// - `OUTLINE_STATE_FILE` (default: `$HOME/.outline-manager/state.json`)
    /// - `OUTLINE_INSTALL_SCRIPT_URL`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let gcp = match (non_empty("GCP_ACCESS_TOKEN"), non_empty("GCP_PROJECT_ID")) {
            (Some(access_token), Some(project_id)) => Some(GcpCredentials {
                access_token,
                project_id,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(Error::MissingEnv("GCP_PROJECT_ID".into())),
            (None, Some(_)) => return Err(Error::MissingEnv("GCP_ACCESS_TOKEN".into())),
        };

        let install = InstallPolicy {
            poll_interval: seconds(
                &non_empty,
                "OUTLINE_INSTALL_POLL_INTERVAL_SECS",
                InstallPolicy::default().poll_interval,
            )?,
            timeout: seconds(
                &non_empty,
                "OUTLINE_INSTALL_TIMEOUT_SECS",
                InstallPolicy::default().timeout,
            )?,
        };
        if install.poll_interval.is_zero() {
            return Err(Error::Config(
                "OUTLINE_INSTALL_POLL_INTERVAL_SECS must be positive".into(),
            ));
        }

        let delete_policy = match non_empty("OUTLINE_DELETE_NOT_FOUND") {
            Some(raw) => raw.parse()?,
            None => DeletePolicy::default(),
        };

        let state_file = match non_empty("OUTLINE_STATE_FILE") {
            Some(path) => PathBuf::from(path),
            None => match non_empty("HOME") {
                Some(home) => PathBuf::from(home).join(".outline-manager").join("state.json"),
                None => PathBuf::from("outline-manager-state.json"),
            },
        };

        Ok(Self {
            digitalocean_token: non_empty("DIGITALOCEAN_TOKEN"),
            gcp,
            install,
            delete_policy,
            state_file,
            install_script_url: non_empty("OUTLINE_INSTALL_SCRIPT_URL")
                .unwrap_or_else(|| DEFAULT_INSTALL_SCRIPT_URL.into()),
        })
    }

    pub fn server_policy(&self) -> ServerPolicy {
        ServerPolicy {
            install: self.install,
            delete: self.delete_policy,
        }
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{key} must be a whole number of seconds, got {raw:?}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<ManagerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ManagerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_install_policy() {
        let config = config_from(&[("HOME", "/home/ops")]).unwrap();

        assert!(config.digitalocean_token.is_none());
        assert!(config.gcp.is_none());
        assert_eq!(config.install, InstallPolicy::default());
        assert_eq!(config.delete_policy, DeletePolicy::IgnoreNotFound);
        assert_eq!(
            config.state_file,
            PathBuf::from("/home/ops/.outline-manager/state.json")
        );
        assert_eq!(config.install_script_url, DEFAULT_INSTALL_SCRIPT_URL);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("DIGITALOCEAN_TOKEN", "dop_v1_abc"),
            ("GCP_ACCESS_TOKEN", "ya29.x"),
            ("GCP_PROJECT_ID", "outline-prod"),
            ("OUTLINE_INSTALL_POLL_INTERVAL_SECS", "10"),
            ("OUTLINE_INSTALL_TIMEOUT_SECS", "900"),
            ("OUTLINE_DELETE_NOT_FOUND", "fail"),
            ("OUTLINE_STATE_FILE", "/tmp/om.json"),
        ])
        .unwrap();

        assert_eq!(config.digitalocean_token.as_deref(), Some("dop_v1_abc"));
        assert_eq!(config.gcp.as_ref().unwrap().project_id, "outline-prod");
        assert_eq!(config.install.poll_interval, Duration::from_secs(10));
        assert_eq!(config.install.timeout, Duration::from_secs(900));
        assert_eq!(config.server_policy().delete, DeletePolicy::Strict);
        assert_eq!(config.state_file, PathBuf::from("/tmp/om.json"));
    }

    #[test]
    fn half_configured_gcp_is_rejected() {
        let err = config_from(&[("GCP_ACCESS_TOKEN", "ya29.x")]).unwrap_err();
        assert!(matches!(err, Error::MissingEnv(key) if key == "GCP_PROJECT_ID"));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        assert!(matches!(
            config_from(&[("OUTLINE_INSTALL_TIMEOUT_SECS", "five")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("OUTLINE_INSTALL_POLL_INTERVAL_SECS", "0")]),
            Err(Error::Config(_))
        ));
    }
}
