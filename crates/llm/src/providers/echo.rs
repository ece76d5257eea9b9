//! Offline echo provider.

use crate::client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
use askq_core::AppResult;

/// Default prefix put in front of the echoed prompt.
pub const DEFAULT_PREFIX: &str = "Echo: ";

/// Provider that answers every prompt with the prompt itself.
///
/// Deterministic and free of network access, so a full gateway/worker/edge
/// deployment can be exercised without a model runtime.
#[derive(Debug, Clone)]
pub struct EchoClient {
    prefix: String,
}

impl EchoClient {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EchoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmClient for EchoClient {
    fn provider_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        let content = format!("{}{}", self.prefix, request.prompt);
        let words = |s: &str| s.split_whitespace().count() as u32;

        Ok(LlmResponse {
            usage: LlmUsage::new(words(&request.prompt), words(&content)),
            content,
            model: "echo".to_string(),
        })
    }
}
