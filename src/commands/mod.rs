mod backup_cmd;
mod config_cmd;
mod queue_cmd;
mod sync_cmd;

pub use backup_cmd::{BackupCommand, RestoreCommand};
pub use config_cmd::ConfigCommand;
pub use queue_cmd::{ListCommand, QueueCommand};
pub use sync_cmd::{clear_failed, retry_failed, sync_now, DaemonCommand, StatusCommand};

use clap::ValueEnum;
use farmsync::config::Config;
use farmsync::db::{init_db, QueueRepository};
use farmsync::sync::{Connectivity, HttpTransport, SyncEngine, SyncSummary};

pub type Engine = SyncEngine<QueueRepository, HttpTransport>;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Opens the queue database and builds an engine over it.
pub async fn open_engine(
    config: &Config,
    connectivity: Connectivity,
) -> Result<Engine, Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path.value).await?;
    let engine_config = config.engine_config();
    let transport = HttpTransport::new(engine_config.request_timeout)?;

    let engine = SyncEngine::new(
        QueueRepository::new(pool),
        transport,
        engine_config,
        connectivity,
        config.identity(),
    )
    .await?;
    Ok(engine)
}

pub fn print_summary(summary: Option<&SyncSummary>) {
    match summary {
        Some(s) => {
            println!(
                "Synced {} of {} item(s) in {} batch(es).",
                s.successful,
                s.total,
                s.batch_sizes.len()
            );
            if s.conflicts > 0 {
                println!("  {} conflict(s) resolved in favour of the server", s.conflicts);
            }
            if s.failed > 0 {
                println!("  {} item(s) failed and will be retried", s.failed);
            }
        }
        None => println!("Nothing to sync."),
    }
}
