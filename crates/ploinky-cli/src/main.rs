//! ploinky - local agent-fleet supervisor CLI

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ploinky")]
#[command(author, version, about = "Local agent-fleet supervisor", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize every declared agent, then supervise the router
    Start {
        /// Router port override
        port: Option<u16>,
    },

    /// Stop every agent container
    Stop {
        /// Collapse the SIGTERM wait to ~100 ms
        #[arg(long)]
        fast: bool,
    },

    /// Stop and remove containers, records and routes
    Destroy {
        /// Collapse the SIGTERM wait to ~100 ms
        #[arg(long)]
        fast: bool,
    },

    /// Show fleet status
    Status,

    /// Run the HTTP router in the foreground
    Router {
        /// Listen port override
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = match cli.command {
        Commands::Start { port } => commands::start(port).await,
        Commands::Stop { fast } => commands::stop(fast).await,
        Commands::Destroy { fast } => commands::destroy(fast).await,
        Commands::Status => commands::status().await,
        Commands::Router { port } => commands::router(port).await,
    };

    if let Err(e) = result {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
