use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Provider-qualified server identifier: `<accountId>:<providerInstanceId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(account_id: &str, instance_id: &str) -> Self {
        Self(format!("{account_id}:{instance_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn account_id(&self) -> &str {
        self.0.split_once(':').map(|(account, _)| account).unwrap_or(&self.0)
    }

    pub fn instance_id(&self) -> &str {
        self.0.split_once(':').map(|(_, instance)| instance).unwrap_or("")
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.split_once(':') {
            Some((account, instance)) if !account.is_empty() && !instance.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(Error::InvalidId(s.to_string())),
        }
    }
}

/// A region or zone where a server can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudLocation {
    /// Provider identifier, e.g. `nyc3` or `us-central1-a`.
    pub id: String,
    pub display_name: String,
    pub available: bool,
}
