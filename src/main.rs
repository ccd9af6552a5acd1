use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{
    open_engine, BackupCommand, ConfigCommand, DaemonCommand, ListCommand, QueueCommand,
    RestoreCommand, StatusCommand,
};
use farmsync::config::Config;
use farmsync::sync::Connectivity;

#[derive(Parser)]
#[command(name = "farmsync")]
#[command(version)]
#[command(about = "Offline-first sync queue for farm records", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a local change for sync
    Queue(QueueCommand),

    /// List queued (or failed) items
    List(ListCommand),

    /// Push the queue to the farm API now
    Sync,

    /// Show queue and connection status
    Status(StatusCommand),

    /// Move failed items back into the queue and sync
    RetryFailed,

    /// Dismiss all failed items
    ClearFailed,

    /// Export the queue as JSON
    Backup(BackupCommand),

    /// Replace the queue with a JSON backup
    Restore(RestoreCommand),

    /// Keep syncing in the background until interrupted
    Daemon(DaemonCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farmsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    // One-shot commands start offline so nothing syncs behind the user's back
    let offline = || Connectivity::new(false);

    match cli.command {
        Some(Commands::Queue(cmd)) => {
            let engine = open_engine(&config, offline()).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::List(cmd)) => {
            let engine = open_engine(&config, offline()).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Sync) => {
            let engine = open_engine(&config, offline()).await?;
            commands::sync_now(&engine, &config).await?;
        }
        Some(Commands::Status(cmd)) => {
            let engine = open_engine(&config, offline()).await?;
            cmd.run(&engine, &config).await?;
        }
        Some(Commands::RetryFailed) => {
            let engine = open_engine(&config, offline()).await?;
            commands::retry_failed(&engine, &config).await?;
        }
        Some(Commands::ClearFailed) => {
            let engine = open_engine(&config, offline()).await?;
            commands::clear_failed(&engine).await?;
        }
        Some(Commands::Backup(cmd)) => {
            let engine = open_engine(&config, offline()).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Restore(cmd)) => {
            let engine = open_engine(&config, offline()).await?;
            cmd.run(&engine).await?;
        }
        Some(Commands::Daemon(cmd)) => {
            cmd.run(&config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
