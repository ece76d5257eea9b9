//! The answerer: one opaque call from question text to answer text.
//!
//! Workers depend only on the [`Answerer`] trait. Retrieval and generation
//! happen behind it; [`LlmAnswerer`] is the implementation that forwards the
//! question to an [`LlmClient`].

use crate::client::{LlmClient, LlmRequest};
use crate::factory::create_client;
use askq_core::{AppConfig, AppError, AppResult};
use std::sync::Arc;

/// Produces an answer for a natural-language question.
///
/// Implementations must be pure functions of the question as far as the
/// dispatch fabric is concerned: a redelivered request may be answered twice.
#[async_trait::async_trait]
pub trait Answerer: Send + Sync {
    async fn answer(&self, question: &str) -> AppResult<String>;
}

/// Answerer backed by an LLM completion.
pub struct LlmAnswerer {
    client: Arc<dyn LlmClient>,
    model: String,
    system: Option<String>,
}

impl LlmAnswerer {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            system: None,
        }
    }

    /// Set the system instruction sent with every question.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Build the answerer for the configured provider and model.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let provider_config = config.get_provider_config(&config.provider);
        let client = create_client(&config.provider, provider_config.as_ref())?;

        tracing::info!(
            "Answerer using provider '{}' with model '{}'",
            client.provider_name(),
            config.model
        );

        let answerer = Self::new(client, &config.model);
        Ok(match config.system_prompt() {
            Some(system) => answerer.with_system(system),
            None => answerer,
        })
    }
}

#[async_trait::async_trait]
impl Answerer for LlmAnswerer {
    async fn answer(&self, question: &str) -> AppResult<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::InvalidInput("Question is empty".to_string()));
        }

        let mut request = LlmRequest::new(question, &self.model);
        if let Some(ref system) = self.system {
            request = request.with_system(system);
        }

        let response = self.client.complete(&request).await?;
        let answer = response.content.trim();

        if answer.is_empty() {
            return Err(AppError::Llm(format!(
                "Model '{}' returned an empty answer",
                response.model
            )));
        }

        tracing::debug!(
            "Answered with {} completion tokens",
            response.usage.completion_tokens
        );

        Ok(answer.to_string())
    }
}
