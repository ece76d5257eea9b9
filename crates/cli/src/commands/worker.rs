//! Worker command handler.

use askq_core::{config::AppConfig, AppError, AppResult};
use askq_dispatch::{shutdown, WorkerConfig, WorkerPool};
use askq_llm::{Answerer, LlmAnswerer};
use clap::Args;
use std::sync::Arc;

use super::{join_all, open_queue, shutdown_on_ctrl_c};

/// Run a pool of workers answering queued questions
#[derive(Args, Debug)]
pub struct WorkerCommand {
    /// Number of concurrent workers (overrides worker.concurrency)
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,
}

impl WorkerCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing worker command");
        tracing::debug!("Worker options: {:?}", self);

        let concurrency = self.concurrency.unwrap_or(config.worker.concurrency);
        if concurrency == 0 {
            return Err(AppError::Config(
                "Worker concurrency must be at least 1".to_string(),
            ));
        }

        let answerer: Arc<dyn Answerer> = Arc::new(LlmAnswerer::from_config(config)?);
        let queue = open_queue(config)?;

        let tx = shutdown::channel();
        shutdown_on_ctrl_c(tx.clone());

        let handles = WorkerPool::spawn(
            concurrency,
            queue,
            answerer,
            WorkerConfig::from(config),
            &tx,
        );
        join_all(handles).await;

        tracing::info!("All workers stopped");
        Ok(())
    }
}
