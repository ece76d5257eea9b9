//! Answer generation for askq workers.
//!
//! This crate provides a provider-agnostic abstraction for the model behind
//! the answerer, plus the [`Answerer`] trait the worker pool calls.
//!
//! # Providers
//! - **Ollama**: Local LLM runtime (default)
//! - **Echo**: Offline, deterministic; for development and tests
//!
//! # Example
//! ```no_run
//! use askq_llm::{Answerer, LlmAnswerer, providers::OllamaClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let answerer = LlmAnswerer::new(Arc::new(OllamaClient::new()), "llama3.2");
//! let answer = answerer.answer("What is heredity?").await?;
//! println!("{}", answer);
//! # Ok(())
//! # }
//! ```

pub mod answerer;
pub mod client;
pub mod factory;
pub mod providers;

// Re-export main types
pub use answerer::{Answerer, LlmAnswerer};
pub use client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
pub use factory::create_client;
pub use providers::{EchoClient, OllamaClient};
