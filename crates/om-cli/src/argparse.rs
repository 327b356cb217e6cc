use clap::{Args, Parser, Subcommand};
use om_core::ProviderName;

#[derive(Parser)]
#[command(
    name = "outline-manager",
    about = "Create and manage Outline servers on cloud providers",
    version,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List locations where a server can be created
    Locations(ProviderArgs),
    /// List Outline servers on a provider
    List(ListArgs),
    /// Create a server and optionally wait for its installation
    Create(CreateArgs),
    /// Delete a server and its cloud resources
    Delete(DeleteArgs),
    /// Servers installed by hand
    #[command(subcommand)]
    Manual(ManualCommands),
    /// Cloud accounts seen by earlier runs
    #[command(subcommand)]
    Accounts(AccountCommands),
}

#[derive(Args)]
pub struct ProviderArgs {
    /// Cloud provider: digitalocean (do) or gcp (gce)
    #[arg(long, short)]
    pub provider: ProviderName,
}

#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Wait until every listed server has finished installing
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args)]
pub struct CreateArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Region slug (DigitalOcean) or zone (GCP)
    #[arg(long, short)]
    pub location: String,

    /// Display name of the server
    #[arg(long, short, default_value = "Outline Server")]
    pub name: String,

    /// Block until the install succeeds or fails
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Server id as printed by `list`
    pub id: String,
}

#[derive(Subcommand)]
pub enum ManualCommands {
    /// Register a server from its access config JSON
    Add {
        /// `{"apiUrl": "...", "certSha256": "..."}`
        access_config: String,
    },
    /// List registered servers
    List,
    /// Forget a registered server
    Forget {
        /// Server id as printed by `manual list`
        id: String,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// List remembered accounts per provider
    List,
    /// Stop remembering an account
    Forget {
        #[command(flatten)]
        provider: ProviderArgs,

        /// Account id, the part of a server id before the first `:`
        account_id: String,
    },
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
