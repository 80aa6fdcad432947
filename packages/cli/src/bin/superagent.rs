use clap::{Parser, Subcommand};
use std::process;

use superagent_cli::{commands, init_tracing};
use superagent_core::Config;

#[derive(Parser)]
#[command(name = "superagent")]
#[command(about = "SuperAgent orchestrator - sandbox task dispatch and message ingestion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook API, ingestion workers and stale-task sweeper
    Serve {
        /// Override the listening port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one stale-task sweep and exit
    Sweep,
    /// Re-apply failed sandbox messages
    Replay {
        #[arg(long, default_value = "3")]
        max_retries: i32,
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;

    match command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            commands::serve(config).await
        }
        Commands::Sweep => commands::sweep(config).await.map(|_| ()),
        Commands::Replay { max_retries, limit } => {
            commands::replay(config, max_retries, limit).await.map(|_| ())
        }
        Commands::Migrate => commands::migrate(config).await,
    }
}
