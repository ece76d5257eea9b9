//! Queue command handler.
//!
//! Operator views of the durable queue.

use askq_core::{config::AppConfig, AppResult};
use askq_queue::DurableQueue;
use clap::{Args, Subcommand};

use super::open_queue;

/// Inspect the durable queue
#[derive(Args, Debug)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum QueueSubcommand {
    /// Show ready, in-flight and dead-lettered counts per channel
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List quarantined messages
    DeadLetters {
        /// Channel to list (default: both configured channels)
        #[arg(long)]
        channel: Option<String>,

        /// Maximum number of entries per channel
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl QueueCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing queue command");

        let queue = open_queue(config)?;
        let channels = [
            config.queue.request_channel.as_str(),
            config.queue.response_channel.as_str(),
        ];

        match &self.command {
            QueueSubcommand::Stats { json } => {
                let mut report = serde_json::Map::new();
                for channel in channels {
                    let stats = queue.stats(channel).await?;
                    if !json {
                        println!(
                            "{:<20} ready {:>6}  in-flight {:>6}  dead {:>6}",
                            channel, stats.ready, stats.in_flight, stats.dead_lettered
                        );
                    }
                    report.insert(channel.to_string(), serde_json::to_value(stats)?);
                }
                if *json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
            QueueSubcommand::DeadLetters {
                channel,
                limit,
                json,
            } => {
                let selected: Vec<&str> = match channel {
                    Some(channel) => vec![channel.as_str()],
                    None => channels.to_vec(),
                };

                let mut entries = Vec::new();
                for channel in selected {
                    entries.extend(queue.dead_letters(channel, *limit).await?);
                }

                if *json {
                    let rows: Vec<serde_json::Value> = entries
                        .iter()
                        .map(|d| {
                            serde_json::json!({
                                "message_id": d.message_id,
                                "channel": d.channel,
                                "delivery_count": d.delivery_count,
                                "reason": d.reason,
                                "quarantined_at": d.quarantined_at,
                                "payload": d.payload_text(),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else if entries.is_empty() {
                    println!("No dead-lettered messages");
                } else {
                    for d in &entries {
                        println!(
                            "#{} [{}] after {} deliveries at {}: {}",
                            d.message_id, d.channel, d.delivery_count, d.quarantined_at, d.reason
                        );
                        println!("    {}", d.payload_text());
                    }
                }
            }
        }

        Ok(())
    }
}
