use std::sync::Arc;

use anyhow::{Context, bail};
use om_core::manual::{AccessConfig, ManualServerRepository};
use om_core::server::ManagedServer;
use om_core::store::{AccountStore, KeyValueStore};
use om_core::trust::MemoryTrustStore;
use om_core::types::ServerId;
use om_core::{ManagedServerRepository, ProviderName, RepositoryRegistry};

use crate::argparse::{AccountCommands, Commands, ManualCommands};

pub struct App {
    pub repositories: RepositoryRegistry,
    pub accounts: AccountStore,
    pub store: Arc<dyn KeyValueStore>,
    pub trust: Arc<MemoryTrustStore>,
}

impl App {
    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Locations(args) => {
                let repo = self.repository(args.provider)?;
                for location in repo.list_locations().await? {
                    let marker = if location.available { "" } else { " (unavailable)" };
                    println!("{:<24} {}{marker}", location.id, location.display_name);
                }
            }
            Commands::List(args) => {
                let repo = self.repository(args.provider.provider)?;
                let servers = repo.list_servers(true).await?;
                self.remember_account(repo.provider(), &servers)?;
                for server in &servers {
                    if args.wait && let Err(e) = server.wait_on_install().await {
                        tracing::warn!(server_id = %server.id(), error = %e, "install did not succeed");
                    }
                    print_server(server);
                }
            }
            Commands::Create(args) => {
                let repo = self.repository(args.provider.provider)?;
                let server = repo.create_server(&args.location, &args.name).await?;
                self.remember_account(repo.provider(), std::slice::from_ref(&server))?;
                println!("created {}", server.id());
                if args.wait {
                    server
                        .wait_on_install()
                        .await
                        .with_context(|| format!("server {} did not install", server.id()))?;
                }
                print_server(&server);
            }
            Commands::Delete(args) => {
                let repo = self.repository(args.provider.provider)?;
                let id: ServerId = args.id.parse()?;
                let servers = repo.list_servers(true).await?;
                let Some(server) = servers.iter().find(|s| s.id() == &id) else {
                    bail!("no {} server with id {id}", repo.provider());
                };
                server.host().delete().await?;
                println!("deleted {id}");
            }
            Commands::Manual(command) => self.run_manual(command).await?,
            Commands::Accounts(command) => self.run_accounts(command)?,
        }
        Ok(())
    }

    async fn run_manual(&self, command: ManualCommands) -> anyhow::Result<()> {
        let repo = ManualServerRepository::load(self.store.clone(), self.trust.clone())?;
        match command {
            ManualCommands::Add { access_config } => {
                let config: AccessConfig = access_config.parse()?;
                let server = repo.add_server(config)?;
                print_server(&server);
            }
            ManualCommands::List => {
                for server in repo.list_servers() {
                    print_server(&server);
                }
            }
            ManualCommands::Forget { id } => {
                let id: ServerId = id.parse()?;
                repo.forget_server(&id).await?;
                println!("forgot {id}");
            }
        }
        Ok(())
    }

    fn run_accounts(&self, command: AccountCommands) -> anyhow::Result<()> {
        match command {
            AccountCommands::List => {
                for provider in [ProviderName::DigitalOcean, ProviderName::Gcp] {
                    let configured = self.repositories.get(provider).is_some();
                    for account in self.accounts.connected_accounts(provider)? {
                        let note = if configured { "" } else { " (no credentials)" };
                        println!("{provider}\t{account}{note}");
                    }
                }
            }
            AccountCommands::Forget {
                provider,
                account_id,
            } => {
                self.accounts.remove_account(provider.provider, &account_id)?;
                println!("forgot {} account {account_id}", provider.provider);
            }
        }
        Ok(())
    }

    fn repository(&self, provider: ProviderName) -> anyhow::Result<&Arc<dyn ManagedServerRepository>> {
        self.repositories.get(provider).with_context(|| {
            format!("{provider} is not configured; set its credentials in the environment")
        })
    }

    /// Record the account that owns `servers` so it is known on the next run.
    fn remember_account(
        &self,
        provider: ProviderName,
        servers: &[Arc<ManagedServer>],
    ) -> anyhow::Result<()> {
        for server in servers {
            self.accounts.add_account(provider, server.id().account_id())?;
        }
        Ok(())
    }
}

fn print_server(server: &ManagedServer) {
    let location = server
        .host()
        .cloud_location()
        .map(|l| l.id.as_str())
        .unwrap_or("-");
    let created = server
        .host()
        .created_at()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".into());
    let state = match server.install_failure() {
        Some(failure) => format!("{:?} ({failure})", server.install_state()),
        None => format!("{:?}", server.install_state()),
    };
    println!(
        "{}\t{}\t{location}\t{created}\t{state}\t{}",
        server.id(),
        server.name(),
        server.management_api_url().unwrap_or("-"),
    );
}

