//! LLM provider factory.
//!
//! This module builds LLM clients from the application configuration:
//! it matches the provider name, picks up provider-specific settings, and
//! creates the client implementation.

use crate::client::LlmClient;
use crate::providers::{ollama::DEFAULT_BASE_URL, EchoClient, OllamaClient};
use askq_core::config::ProviderConfig;
use askq_core::{AppError, AppResult};
use std::sync::Arc;
use std::time::Duration;

/// Create an LLM client for `provider`.
///
/// # Arguments
/// * `provider` - Provider identifier ("ollama", "echo")
/// * `provider_config` - Optional provider section from config.yaml
///
/// # Errors
/// Returns error if the provider is unknown, the config section belongs to a
/// different provider, or the HTTP client cannot be built.
pub fn create_client(
    provider: &str,
    provider_config: Option<&ProviderConfig>,
) -> AppResult<Arc<dyn LlmClient>> {
    match (provider.to_lowercase().as_str(), provider_config) {
        ("ollama", None) => Ok(Arc::new(OllamaClient::with_base_url(DEFAULT_BASE_URL))),
        ("ollama", Some(ProviderConfig::Ollama { endpoint, timeout, .. })) => {
            let client = match timeout {
                Some(secs) => OllamaClient::with_timeout(endpoint, Duration::from_secs(*secs))?,
                None => OllamaClient::with_base_url(endpoint),
            };
            Ok(Arc::new(client))
        }
        ("echo", None) => Ok(Arc::new(EchoClient::new())),
        ("echo", Some(ProviderConfig::Echo { prefix })) => Ok(Arc::new(match prefix {
            Some(prefix) => EchoClient::with_prefix(prefix),
            None => EchoClient::new(),
        })),
        ("ollama", Some(_)) | ("echo", Some(_)) => Err(AppError::Config(format!(
            "Provider section for '{}' does not match its provider type",
            provider
        ))),
        _ => Err(AppError::Config(format!("Unknown provider: {}", provider))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_ollama_client() {
        let client = create_client("ollama", None).unwrap();
        assert_eq!(client.provider_name(), "ollama");
    }

    #[test]
    fn test_create_ollama_with_custom_endpoint() {
        let config = ProviderConfig::Ollama {
            endpoint: "http://localhost:8080".to_string(),
            model: "llama3".to_string(),
            timeout: Some(30),
        };
        let client = create_client("ollama", Some(&config)).unwrap();
        assert_eq!(client.provider_name(), "ollama");
    }

    #[test]
    fn test_create_echo_client() {
        let client = create_client("ECHO", None).unwrap();
        assert_eq!(client.provider_name(), "echo");
    }

    #[test]
    fn test_mismatched_section() {
        let config = ProviderConfig::Echo { prefix: None };
        match create_client("ollama", Some(&config)) {
            Err(err) => assert!(err.to_string().contains("does not match")),
            Ok(_) => panic!("Expected error for mismatched provider section"),
        }
    }

    #[test]
    fn test_unknown_provider() {
        match create_client("unknown", None) {
            Err(err) => assert!(err.to_string().contains("Unknown provider")),
            Ok(_) => panic!("Expected error for unknown provider"),
        }
    }
}
