//! EngineLink Node Binary

use clap::{Parser, Subcommand};
use enginelink_core::BridgeConfig;
use enginelink_node::NodeBuilder;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "enginelink-node")]
#[command(about = "EngineLink - State synchronization bridge for game engines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured log level
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Write the default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// `RUST_LOG` wins over the configured level when set
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_level } => {
            let mut config = match config {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)?;
                    BridgeConfig::from_json(&content)?
                }
                None => BridgeConfig::default(),
            };
            if let Some(level) = log_level {
                config.log_level = level;
            }

            init_logging(&config.log_level);
            info!("Starting EngineLink bridge...");

            let node = NodeBuilder::new().config(config).build()?;
            node.start().await?;
        }

        Commands::Config { output } => {
            let json = BridgeConfig::default().to_json()?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Configuration saved to: {}", path.display());
                }
                None => {
                    println!("{}", json);
                }
            }
        }
    }

    Ok(())
}
