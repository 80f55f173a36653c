//! chainevent CLI.
//!
//! # Commands
//! ```text
//! chainevent run   --config <chainevent.yaml>
//! chainevent check --config <chainevent.yaml> [--json]
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd_check;
mod cmd_run;

#[derive(Parser)]
#[command(
    name = "chainevent",
    about = "Watch EVM contracts for events and forward them to webhooks",
    long_about = "
chainevent polls an EVM JSON-RPC node for contract event logs, decodes them
against an ABI, stores each log once and POSTs new records to a webhook.

ENVIRONMENT VARIABLES:
  RUST_LOG    tracing filter, overrides the `log` section of the config
",
    version
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every poller and notifier until interrupted
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "./chainevent.yaml")]
        config: PathBuf,
    },

    /// Validate the configuration and show what would be watched
    Check {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "./chainevent.yaml")]
        config: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => cmd_run::run(&config, cli.verbose).await,
        Commands::Check { config, json } => cmd_check::run(&config, json),
    }
}
