//! Local persistence for account identifiers and manual server configs.
//!
//! Server install state is never persisted; it is rediscovered from the
//! provider on every listing.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::{Error, ProviderName, Result};

/// String key/value persistence.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Every write rewrites the whole file through a temp file and rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "state file missing, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(Error::Store(format!("read {}: {e}", path.display()))),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("create {}: {e}", parent.display())))?;
        }

        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Store(format!("encode state: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| Error::Store(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Store(format!("rename to {}: {e}", self.path.display())))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

/// Connected cloud accounts, keyed by provider.
#[derive(Clone)]
pub struct AccountStore {
    store: Arc<dyn KeyValueStore>,
}

impl AccountStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(provider: ProviderName) -> String {
        format!("accounts.{provider}")
    }

    pub fn connected_accounts(&self, provider: ProviderName) -> Result<Vec<String>> {
        match self.store.get(&Self::key(provider))? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("decode {provider} accounts: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Remember `account_id`. Adding an already known account is a no-op.
    pub fn add_account(&self, provider: ProviderName, account_id: &str) -> Result<()> {
        let mut accounts = self.connected_accounts(provider)?;
        if accounts.iter().any(|a| a == account_id) {
            return Ok(());
        }
        accounts.push(account_id.to_string());
        self.write(provider, &accounts)
    }

    pub fn remove_account(&self, provider: ProviderName, account_id: &str) -> Result<()> {
        let mut accounts = self.connected_accounts(provider)?;
        accounts.retain(|a| a != account_id);
        if accounts.is_empty() {
            return self.store.remove(&Self::key(provider));
        }
        self.write(provider, &accounts)
    }

    fn write(&self, provider: ProviderName, accounts: &[String]) -> Result<()> {
        let raw = serde_json::to_string(accounts)
            .map_err(|e| Error::Store(format!("encode {provider} accounts: {e}")))?;
        self.store.set(&Self::key(provider), &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_are_deduplicated_per_provider() {
        let accounts = AccountStore::new(Arc::new(MemoryStore::default()));

        accounts.add_account(ProviderName::DigitalOcean, "uuid-1").unwrap();
        accounts.add_account(ProviderName::DigitalOcean, "uuid-1").unwrap();
        accounts.add_account(ProviderName::Gcp, "my-project").unwrap();

        assert_eq!(
            accounts.connected_accounts(ProviderName::DigitalOcean).unwrap(),
            vec!["uuid-1".to_string()]
        );
        assert_eq!(
            accounts.connected_accounts(ProviderName::Gcp).unwrap(),
            vec!["my-project".to_string()]
        );

        accounts.remove_account(ProviderName::DigitalOcean, "uuid-1").unwrap();
        assert!(accounts.connected_accounts(ProviderName::DigitalOcean).unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("accounts.gcp", r#"["p1"]"#).unwrap();
        store.set("scratch", "x").unwrap();
        store.remove("scratch").unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("accounts.gcp").unwrap().as_deref(), Some(r#"["p1"]"#));
        assert_eq!(reopened.get("scratch").unwrap(), None);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(JsonFileStore::open(&path), Err(Error::Store(_))));
    }
}
