//! Escrow node entry point.
//!
//! Loads configuration from an optional `.env` file and `ESCROW_*`
//! environment variables, builds the node and runs the reconciliation loops
//! until Ctrl-C.

use clap::{Parser, Subcommand};
use escrow_engine::{EngineConfig, EscrowNode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "escrow-node", about = "Bitcoin commitment escrow node", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation loops until interrupted (default)
    Run,
    /// Print the node health report as JSON and exit
    Health,
    /// Print the effective configuration as JSON and exit
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // a missing .env is fine
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            let mut shown = config.clone();
            for secret in [&mut shown.api_key, &mut shown.database_url] {
                if secret.is_some() {
                    *secret = Some("<redacted>".to_string());
                }
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        Command::Health => {
            let node = EscrowNode::new(config).await?;
            let health = node.health_check().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Run => {
            let node = EscrowNode::new(config).await?;
            node.start().await?;
            info!("Escrow node running; press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            node.shutdown().await?;
        }
    }

    Ok(())
}
