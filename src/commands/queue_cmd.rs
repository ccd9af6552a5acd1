use clap::Args;
use serde_json::Value;

use super::{Engine, OutputFormat};
use farmsync::models::{LocalChange, SyncAction, SyncItem};
use farmsync::sync::{HttpMethod, QueueStore};

#[derive(Args)]
pub struct QueueCommand {
    /// Entity type (e.g. milk_record, dairy_cow, task)
    pub entity: String,

    /// Action: create, update or delete
    pub action: SyncAction,

    /// Record payload as a JSON object
    #[arg(long, short)]
    pub payload: Option<String>,
}

impl QueueCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
        let payload = parse_payload(self.action, self.payload.as_deref())?;
        let item = engine
            .queue_for_sync(LocalChange::new(&self.entity, self.action, payload))
            .await?;

        println!("Queued {} ({} {})", item.id, item.action, item.entity);
        println!("Run 'farmsync sync' to push it now.");
        Ok(())
    }
}

fn parse_payload(action: SyncAction, raw: Option<&str>) -> Result<Value, String> {
    let payload: Value = match raw {
        Some(s) => serde_json::from_str(s).map_err(|e| format!("Invalid payload JSON: {}", e))?,
        None => Value::Object(Default::default()),
    };

    if !payload.is_object() {
        return Err("Payload must be a JSON object".to_string());
    }
    if action == SyncAction::Delete && payload.get("id").is_none() {
        return Err("Delete payloads need an 'id' field".to_string());
    }
    Ok(payload)
}

#[derive(Args)]
pub struct ListCommand {
    /// Show the failed items instead of the queue
    #[arg(long)]
    pub failed: bool,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl ListCommand {
    pub async fn run(&self, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
        let items = if self.failed {
            engine.store().list_failed().await?
        } else {
            engine.store().list().await?
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            OutputFormat::Text => {
                if items.is_empty() {
                    if self.failed {
                        println!("No failed items.");
                    } else {
                        println!("Queue is empty.");
                    }
                    return Ok(());
                }
                for item in &items {
                    println!("{}", format_row(item));
                }
            }
        }
        Ok(())
    }
}

fn format_row(item: &SyncItem) -> String {
    let mut row = format!(
        "{}  {:<6} {:<18} attempts: {}",
        item.id,
        HttpMethod::from(item.action).as_str(),
        item.entity,
        item.attempts
    );
    if let Some(error) = &item.last_error {
        row.push_str(&format!("  last error: {}", error));
    }
    row
}
