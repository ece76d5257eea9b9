//! Ask command handler.
//!
//! The client side of the fabric: submits a question to the edge and polls
//! until its answer arrives.

use askq_core::{config::AppConfig, AppError, AppResult, SessionId};
use askq_edge::EdgeClient;
use clap::Args;
use std::time::Duration;
use uuid::Uuid;

/// Ask a question through the edge API
#[derive(Args, Debug)]
pub struct AskCommand {
    /// The question to ask
    pub question: String,

    /// Edge base URL (overrides edge.url)
    #[arg(long)]
    pub edge_url: Option<String>,

    /// Session id to ask under (default: a fresh one)
    #[arg(long)]
    pub session: Option<String>,

    /// Number of polls before giving up
    #[arg(long, default_value_t = 10)]
    pub max_attempts: u32,

    /// Pause between polls in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl AskCommand {
    /// Execute the ask command.
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing ask command");
        tracing::debug!("Ask command options: {:?}", self);

        let question = self.question.trim();
        if question.is_empty() {
            return Err(AppError::InvalidInput("No question provided".to_string()));
        }

        let session = match &self.session {
            Some(id) => SessionId::parse(id.as_str())?,
            None => SessionId::parse(format!("cli-{}", Uuid::new_v4()))?,
        };
        let edge_url = self.edge_url.as_deref().unwrap_or(&config.edge.url);
        let client = EdgeClient::new(edge_url, session)?;

        let (query_id, answer) = client
            .ask(
                question,
                self.max_attempts,
                Duration::from_millis(self.interval_ms),
            )
            .await?;

        if self.json {
            let output = serde_json::json!({
                "query_id": query_id,
                "question": question,
                "answer": answer,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", answer);
        }

        Ok(())
    }
}
