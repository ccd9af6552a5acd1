use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;

use super::OutputFormat;
use farmsync::config::{Config, ConfigValue};

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!("api_base_url: {}", config.api_base_url.value);
                        println!("  source: {}", config.api_base_url.source);
                        println!();

                        let token = if config.auth_token.value.is_some() {
                            "(set)"
                        } else {
                            "(not set)"
                        };
                        println!("auth_token: {}", token);
                        println!("  source: {}", config.auth_token.source);
                        println!();

                        print_optional("user_id", &config.user_id);
                        print_optional("device_id", &config.device_id);

                        let s = &config.sync;
                        println!("sync:");
                        println!("  interval_secs: {}", s.interval_secs);
                        println!("  max_retries: {}", s.max_retries);
                        println!("  batch_size: {}", s.batch_size);
                        println!("  item_delay_ms: {}", s.item_delay_ms);
                        println!("  batch_delay_ms: {}", s.batch_delay_ms);
                        println!("  reconnect_delay_ms: {}", s.reconnect_delay_ms);
                        println!("  enqueue_delay_ms: {}", s.enqueue_delay_ms);
                        println!("  request_timeout_secs: {}", s.request_timeout_secs);
                        println!("  probe_interval_secs: {}", s.probe_interval_secs);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = Config::default_config_path();

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'farmsync config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let default_config = r#"# farmsync configuration

# Path to the queue database (default: platform data dir/farmsync/queue.db)
# database_path: queue.db

# Farm API base URL
api_base_url: https://api.example.com

# auth_token: your-token
# user_id: farmer-1

sync:
  interval_secs: 30
  max_retries: 3
  batch_size: 10
"#;

                let mut file = fs::File::create(&config_path)?;
                file.write_all(default_config.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}

fn print_optional(name: &str, value: &ConfigValue<Option<String>>) {
    println!("{}: {}", name, value.value.as_deref().unwrap_or("(not set)"));
    println!("  source: {}", value.source);
    println!();
}
