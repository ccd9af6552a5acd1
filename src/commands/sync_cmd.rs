//! Sync CLI commands: one-shot cycles, status, failed-item handling and the
//! long-running daemon.

use clap::Args;
use tokio::sync::broadcast::error::RecvError;

use super::{open_engine, print_summary, Engine, OutputFormat};
use farmsync::config::Config;
use farmsync::sync::{check_server, spawn_health_probe, Connectivity, SyncEvent};

/// Probes the farm API and, if reachable, drains the queue once.
pub async fn sync_now(
    engine: &Engine,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let base_url = &config.api_base_url.value;
    println!("Checking {}...", base_url);

    let online = check_server(base_url, engine.config().await.request_timeout).await;
    engine.connectivity().set_online(online);
    if !online {
        println!("Farm API unreachable, items stay queued.");
        return Ok(());
    }

    let summary = engine.force_sync().await?;
    print_summary(summary.as_ref());
    Ok(())
}

pub async fn retry_failed(
    engine: &Engine,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let online = check_server(
        &config.api_base_url.value,
        engine.config().await.request_timeout,
    )
    .await;
    engine.connectivity().set_online(online);

    let report = engine.retry_failed_items().await?;
    if report.retried == 0 {
        println!("No failed items to retry.");
        return Ok(());
    }

    println!("Requeued {} failed item(s).", report.retried);
    if online {
        print_summary(report.summary.as_ref());
    } else {
        println!("Farm API unreachable, they will sync when it is back.");
    }
    Ok(())
}

pub async fn clear_failed(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let cleared = engine.clear_failed_items().await?;
    println!("Dismissed {} failed item(s).", cleared);
    Ok(())
}

#[derive(Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(
        &self,
        engine: &Engine,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let online = check_server(
            &config.api_base_url.value,
            engine.config().await.request_timeout,
        )
        .await;
        engine.connectivity().set_online(online);
        let status = engine.status().await?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
            OutputFormat::Text => {
                println!("Sync Status");
                println!("===========");
                println!();
                println!("Farm API:     {}", config.api_base_url.value);
                println!(
                    "Connection:   {}",
                    if status.is_online { "online" } else { "offline" }
                );
                println!("Device:       {}", engine.device_id().await);
                println!("Queued:       {}", status.queue_size);
                println!("Failed:       {}", status.failed_items);
                match status.last_sync_time {
                    Some(at) => println!("Last sync:    {}", at.to_rfc3339()),
                    None => println!("Last sync:    never"),
                }
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct DaemonCommand {
    /// Assume the farm API is always reachable instead of probing /health
    #[arg(long)]
    pub no_probe: bool,
}

impl DaemonCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let base_url = config.api_base_url.value.clone();
        let engine_config = config.engine_config();

        let online = self.no_probe || check_server(&base_url, engine_config.request_timeout).await;
        let connectivity = Connectivity::new(online);
        let engine = open_engine(config, connectivity.clone()).await?;

        let probe = (!self.no_probe).then(|| {
            spawn_health_probe(
                connectivity,
                base_url.clone(),
                config.probe_interval(),
                engine_config.request_timeout,
            )
        });

        let mut events = engine.subscribe();
        engine.start().await;
        tracing::info!(
            "Sync daemon running against {} ({})",
            base_url,
            if online { "online" } else { "offline" }
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} sync event(s)", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        tracing::info!("Shutting down sync daemon");
        if let Some(handle) = probe {
            handle.abort();
        }
        engine.shutdown().await;
        Ok(())
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Queued { item, queue_size } => {
            tracing::info!("Queued {} ({} pending)", item.id, queue_size)
        }
        SyncEvent::Started { queue_size } => tracing::info!("Sync started: {} item(s)", queue_size),
        SyncEvent::ItemSynced { item } => {
            tracing::info!("Synced {} ({} {})", item.id, item.action, item.entity)
        }
        SyncEvent::ItemFailed { item, error } => tracing::error!(
            "Gave up on {} after {} attempts: {}",
            item.id,
            item.attempts,
            error
        ),
        SyncEvent::Completed {
            successful,
            failed,
            total,
            ..
        } => tracing::info!(
            "Sync completed: {}/{} successful, {} failed",
            successful,
            total,
            failed
        ),
    }
}
