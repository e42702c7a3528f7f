use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::commands;
use crate::error::Result;

#[derive(Debug, Parser)]
#[command(
    name = "cdp-relay",
    version,
    about = "Local CDP relay between DevTools clients and a Chrome extension"
)]
pub struct Cli {
    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay server
    Serve(ServeArgs),
    /// Query a running relay
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "CDP_RELAY_PORT")]
    pub port: Option<u16>,

    /// Interface to bind
    #[arg(long, env = "CDP_RELAY_HOST")]
    pub host: Option<String>,

    /// Bearer token required on /cdp upgrades
    #[arg(long, env = "CDP_RELAY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Generate a fresh bearer token at startup
    #[arg(long, conflicts_with = "token")]
    pub generate_token: bool,

    /// Allowed extension origin (repeatable)
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    pub allow_origins: Vec<String>,

    /// Path to a relay.toml config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Port the relay listens on
    #[arg(long, env = "CDP_RELAY_PORT")]
    pub port: Option<u16>,

    /// Host the relay listens on
    #[arg(long, env = "CDP_RELAY_HOST")]
    pub host: Option<String>,
}

impl Cli {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Serve(args) => commands::serve::run(self, args).await,
            Commands::Status(args) => commands::status::run(self, args).await,
        }
    }
}
