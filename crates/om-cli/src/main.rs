mod argparse;
mod commands;

use std::sync::Arc;

use anyhow::Context;
use om_core::config::ManagerConfig;
use om_core::store::{AccountStore, JsonFileStore, KeyValueStore};
use om_core::trust::MemoryTrustStore;
use tracing_subscriber::EnvFilter;

use crate::argparse::parse_args;
use crate::commands::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = ManagerConfig::from_env().context("failed to load configuration")?;

    let store: Arc<dyn KeyValueStore> = Arc::new(
        JsonFileStore::open(&config.state_file)
            .with_context(|| format!("failed to open {}", config.state_file.display()))?,
    );
    let trust = Arc::new(MemoryTrustStore::default());
    let repositories = om_core::build_repositories(&config, trust.clone());
    tracing::info!(providers = ?repositories.available(), "cloud providers ready");

    let app = App {
        repositories,
        accounts: AccountStore::new(store.clone()),
        store,
        trust,
    };
    app.run(cli.command).await
}
