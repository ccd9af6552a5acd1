use clap::Args;
use std::path::PathBuf;

use super::Engine;
use farmsync::sync::SyncBackup;

#[derive(Args)]
pub struct BackupCommand {
    /// Write the backup here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

impl BackupCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
        let backup = engine.export_backup().await?;
        let json = backup.to_json_pretty()?;

        match &self.output {
            Some(path) => {
                std::fs::write(path, json)?;
                println!(
                    "Backed up {} queued and {} failed item(s) to {}",
                    backup.sync_queue.len(),
                    backup.failed_items.len(),
                    path.display()
                );
            }
            None => println!("{}", json),
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct RestoreCommand {
    /// Backup file produced by 'farmsync backup'
    pub file: PathBuf,
}

impl RestoreCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(&self.file)?;
        let backup = SyncBackup::from_json(&contents)?;
        let (queued, failed) = (backup.sync_queue.len(), backup.failed_items.len());

        engine.restore_backup(backup).await?;
        println!(
            "Restored {} queued and {} failed item(s) from {}",
            queued,
            failed,
            self.file.display()
        );
        Ok(())
    }
}
