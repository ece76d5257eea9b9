//! Configuration management for askq.
//!
//! This module handles loading and merging configuration from multiple sources:
//! - Defaults
//! - Config file (.askq/config.yaml)
//! - Environment variables
//! - Command-line flags
//!
//! The configuration is workspace-centric: the durable queue database and
//! the config file live in `.askq/` unless overridden.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::{AppError, AppResult};

/// Providers the answerer factory knows how to build.
pub const KNOWN_PROVIDERS: [&str; 2] = ["ollama", "echo"];

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the workspace root (contains .askq/)
    pub workspace: PathBuf,

    /// Optional config file path
    pub config_file: Option<PathBuf>,

    /// Answerer provider ("ollama", "echo")
    pub provider: String,

    /// Model identifier passed to the provider
    pub model: String,

    /// Log level override
    pub log_level: Option<String>,

    /// Log output format
    pub log_format: LogFormat,

    /// Verbose mode (enables debug logging)
    pub verbose: bool,

    /// Disable colored output
    pub no_color: bool,

    pub queue: QueueSettings,
    pub gateway: GatewaySettings,
    pub worker: WorkerSettings,
    pub edge: EdgeSettings,

    /// LLM provider configurations
    pub llm: Option<LlmConfig>,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// SQLite database path; `None` means `.askq/queue.db` in the workspace.
    /// The special value `:memory:` keeps the queue in process memory.
    pub path: Option<PathBuf>,

    pub request_channel: String,
    pub response_channel: String,

    /// How long a received message stays invisible before redelivery
    pub visibility_timeout_secs: u64,

    /// Deliveries without acknowledgment before a message is dead-lettered
    pub max_deliveries: u32,

    /// Poll interval for receivers waiting on messages from other processes
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: None,
            request_channel: "query_requests".to_string(),
            response_channel: "query_responses".to_string(),
            visibility_timeout_secs: 300,
            max_deliveries: 5,
            poll_interval_ms: 250,
        }
    }
}

/// Dispatch gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub listen_addr: String,

    /// Upper bound on a stream's wait between checks for ready results
    pub stream_poll_interval_ms: u64,

    /// Interval between keep-alive lines on an idle result stream
    pub keepalive_secs: u64,

    /// Idle time after which a caller session is reaped
    pub session_ttl_secs: u64,

    /// Lifetime of unclaimed results and of the duplicate-detection window
    pub result_ttl_secs: u64,

    pub reap_interval_secs: u64,

    /// Retry policy for publishing to the request channel
    pub publish_retry: BackoffPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:50051".to_string(),
            stream_poll_interval_ms: 500,
            keepalive_secs: 15,
            session_ttl_secs: 600,
            result_ttl_secs: 3600,
            reap_interval_secs: 30,
            publish_retry: BackoffPolicy::default(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    /// Worker tasks per process
    pub concurrency: usize,

    pub answer_timeout_secs: u64,

    /// Delay before a failed message becomes visible again
    pub retry_delay_ms: u64,

    /// Retry policy for publishing answers to the response channel
    pub publish_retry: BackoffPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            answer_timeout_secs: 120,
            retry_delay_ms: 5_000,
            publish_retry: BackoffPolicy::default(),
        }
    }
}

/// Edge API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeSettings {
    pub listen_addr: String,

    /// Base URL of the dispatch gateway
    pub gateway_url: String,

    /// Base URL clients use to reach the edge
    pub url: String,

    /// Gateway session used by the edge's background stream.
    /// `None` generates one per process.
    pub session_id: Option<String>,

    /// Wait applied to `GET /get-response` when the caller gives none
    pub default_poll_wait_ms: u64,

    /// Cap on caller-requested waits
    pub max_poll_wait_ms: u64,

    pub cache_ttl_secs: u64,

    /// Reconnect policy for the background stream
    pub reconnect: BackoffPolicy,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            gateway_url: "http://localhost:50051".to_string(),
            url: "http://localhost:8000".to_string(),
            session_id: None,
            default_poll_wait_ms: 250,
            max_poll_wait_ms: 30_000,
            cache_ttl_secs: 3600,
            reconnect: BackoffPolicy {
                initial_ms: 500,
                max_ms: 30_000,
                max_attempts: u32::MAX,
            },
        }
    }
}

/// LLM configuration from config.yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(rename = "activeProvider")]
    pub active_provider: String,

    /// System instruction prepended to every question
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: Option<String>,

    pub providers: HashMap<String, ProviderConfig>,
}

/// Provider-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderConfig {
    Ollama {
        endpoint: String,
        model: String,
        timeout: Option<u64>,
    },
    Echo {
        prefix: Option<String>,
    },
}

/// Full configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    llm: Option<LlmConfig>,
    workspace: Option<WorkspaceConfig>,
    logging: Option<LoggingConfig>,
    queue: Option<QueueSettings>,
    gateway: Option<GatewaySettings>,
    worker: Option<WorkerSettings>,
    edge: Option<EdgeSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceConfig {
    path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingConfig {
    level: Option<String>,
    color: Option<bool>,
    format: Option<LogFormat>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            provider: "ollama".to_string(),
            model: "llama3.2".to_string(),
            log_level: None,
            log_format: LogFormat::Pretty,
            verbose: false,
            no_color: false,
            queue: QueueSettings::default(),
            gateway: GatewaySettings::default(),
            worker: WorkerSettings::default(),
            edge: EdgeSettings::default(),
            llm: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the config file, environment variables and defaults.
    ///
    /// Environment variables:
    /// - `ASKQ_WORKSPACE`: Override workspace path
    /// - `ASKQ_CONFIG`: Path to config file
    /// - `ASKQ_QUEUE_PATH`: Queue database path
    /// - `ASKQ_REQUEST_QUEUE` / `ASKQ_RESPONSE_QUEUE`: Channel names
    /// - `ASKQ_GATEWAY_ADDR` / `ASKQ_GATEWAY_URL`: Gateway bind address / base URL
    /// - `ASKQ_EDGE_ADDR` / `ASKQ_EDGE_URL`: Edge bind address / base URL
    /// - `ASKQ_PROVIDER` / `ASKQ_MODEL`: Answerer provider and model
    /// - `RUST_LOG`: Log level
    /// - `NO_COLOR`: Disable colored output
    ///
    /// # Example
    /// ```no_run
    /// use askq_core::config::AppConfig;
    ///
    /// let config = AppConfig::load().expect("Failed to load config");
    /// println!("Queue: {:?}", config.queue_path());
    /// ```
    pub fn load() -> AppResult<Self> {
        let mut config = Self::default();

        if let Ok(workspace) = std::env::var("ASKQ_WORKSPACE") {
            config.workspace = PathBuf::from(workspace);
        }

        if let Ok(config_file) = std::env::var("ASKQ_CONFIG") {
            config.config_file = Some(PathBuf::from(config_file));
        }

        if !config.workspace.exists() {
            return Err(AppError::Config(format!(
                "Workspace directory does not exist: {:?}",
                config.workspace
            )));
        }

        let config_path = match config.config_file {
            Some(ref cf) => cf.clone(),
            None => config.askq_dir().join("config.yaml"),
        };

        if config_path.exists() {
            config = config.merge_yaml(&config_path)?;
        }

        // Environment variables override YAML config
        config.apply_env();

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("ASKQ_QUEUE_PATH") {
            self.queue.path = Some(PathBuf::from(path));
        }
        if let Ok(name) = std::env::var("ASKQ_REQUEST_QUEUE") {
            self.queue.request_channel = name;
        }
        if let Ok(name) = std::env::var("ASKQ_RESPONSE_QUEUE") {
            self.queue.response_channel = name;
        }
        if let Ok(addr) = std::env::var("ASKQ_GATEWAY_ADDR") {
            self.gateway.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("ASKQ_GATEWAY_URL") {
            self.edge.gateway_url = url;
        }
        if let Ok(addr) = std::env::var("ASKQ_EDGE_ADDR") {
            self.edge.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("ASKQ_EDGE_URL") {
            self.edge.url = url;
        }
        if let Ok(provider) = std::env::var("ASKQ_PROVIDER") {
            self.provider = provider;
        }
        if let Ok(model) = std::env::var("ASKQ_MODEL") {
            self.model = model;
        }

        self.log_level = std::env::var("RUST_LOG").ok().or(self.log_level.take());

        if std::env::var("NO_COLOR").is_ok() {
            self.no_color = true;
        }
    }

    /// Merge a YAML configuration file into this config.
    ///
    /// Sections present in the file replace the corresponding defaults;
    /// fields missing inside a section keep their default values.
    pub fn merge_yaml(&self, path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config_file: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        let mut result = self.clone();

        if let Some(path) = config_file.workspace.and_then(|ws| ws.path) {
            result.workspace = PathBuf::from(path);
        }

        if let Some(logging) = config_file.logging {
            if let Some(level) = logging.level {
                result.log_level = Some(level);
            }
            if let Some(color) = logging.color {
                result.no_color = !color;
            }
            if let Some(format) = logging.format {
                result.log_format = format;
            }
        }

        if let Some(queue) = config_file.queue {
            result.queue = queue;
        }
        if let Some(gateway) = config_file.gateway {
            result.gateway = gateway;
        }
        if let Some(worker) = config_file.worker {
            result.worker = worker;
        }
        if let Some(edge) = config_file.edge {
            result.edge = edge;
        }

        if let Some(llm) = config_file.llm {
            result.provider = llm.active_provider.clone();

            if let Some(provider_config) = llm.providers.get(&llm.active_provider) {
                result.model = match provider_config {
                    ProviderConfig::Ollama { model, .. } => model.clone(),
                    ProviderConfig::Echo { .. } => "echo".to_string(),
                };
            }

            result.llm = Some(llm);
        }

        Ok(result)
    }

    /// Apply CLI overrides to the configuration.
    ///
    /// CLI flags take precedence over environment variables and the config file.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        workspace: Option<PathBuf>,
        config_file: Option<PathBuf>,
        provider: Option<String>,
        model: Option<String>,
        log_level: Option<String>,
        verbose: bool,
        no_color: bool,
    ) -> Self {
        if let Some(workspace) = workspace {
            self.workspace = workspace;
        }

        if let Some(config_file) = config_file {
            self.config_file = Some(config_file);
        }

        if let Some(provider) = provider {
            self.provider = provider;
        }

        if let Some(model) = model {
            self.model = model;
        }

        if let Some(log_level) = log_level {
            self.log_level = Some(log_level);
        }

        if verbose {
            self.verbose = true;
            // Verbose mode implies debug logging
            if self.log_level.is_none() {
                self.log_level = Some("debug".to_string());
            }
        }

        if no_color {
            self.no_color = true;
        }

        self
    }

    /// Get the path to the .askq directory.
    pub fn askq_dir(&self) -> PathBuf {
        self.workspace.join(".askq")
    }

    /// Ensure the .askq directory exists.
    pub fn ensure_askq_dir(&self) -> AppResult<()> {
        let askq_dir = self.askq_dir();
        if !askq_dir.exists() {
            std::fs::create_dir_all(&askq_dir).map_err(|e| {
                AppError::Config(format!("Failed to create .askq directory: {}", e))
            })?;
        }
        Ok(())
    }

    /// Resolved queue database location.
    pub fn queue_path(&self) -> PathBuf {
        self.queue
            .path
            .clone()
            .unwrap_or_else(|| self.askq_dir().join("queue.db"))
    }

    /// Get the configuration of a named provider.
    pub fn get_provider_config(&self, provider: &str) -> Option<ProviderConfig> {
        self.llm
            .as_ref()
            .and_then(|llm| llm.providers.get(provider).cloned())
    }

    /// Configured system instruction for the answerer, if any.
    pub fn system_prompt(&self) -> Option<&str> {
        self.llm.as_ref().and_then(|llm| llm.system_prompt.as_deref())
    }

    /// Validate the configuration before starting any component.
    pub fn validate(&self) -> AppResult<()> {
        let provider = &self.provider;
        if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown provider: {}. Supported: {}",
                provider,
                KNOWN_PROVIDERS.join(", ")
            )));
        }

        if self.queue.request_channel.trim().is_empty()
            || self.queue.response_channel.trim().is_empty()
        {
            return Err(AppError::Config("Channel names must not be empty".to_string()));
        }

        if self.queue.request_channel == self.queue.response_channel {
            return Err(AppError::Config(format!(
                "Request and response channels must differ (both are '{}')",
                self.queue.request_channel
            )));
        }

        if self.queue.max_deliveries == 0 {
            return Err(AppError::Config("queue.maxDeliveries must be at least 1".to_string()));
        }

        if self.queue.visibility_timeout_secs == 0 {
            return Err(AppError::Config(
                "queue.visibilityTimeoutSecs must be at least 1".to_string(),
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(AppError::Config("worker.concurrency must be at least 1".to_string()));
        }

        for (name, value) in [
            ("queue.pollIntervalMs", self.queue.poll_interval_ms),
            ("gateway.streamPollIntervalMs", self.gateway.stream_poll_interval_ms),
            ("gateway.reapIntervalSecs", self.gateway.reap_interval_secs),
            ("worker.answerTimeoutSecs", self.worker.answer_timeout_secs),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be at least 1", name)));
            }
        }

        // A lease that lapses mid-answer hands the request to a second worker
        if self.worker.answer_timeout_secs >= self.queue.visibility_timeout_secs {
            return Err(AppError::Config(format!(
                "worker.answerTimeoutSecs ({}) must be below queue.visibilityTimeoutSecs ({})",
                self.worker.answer_timeout_secs, self.queue.visibility_timeout_secs
            )));
        }

        for (name, addr) in [
            ("gateway.listenAddr", &self.gateway.listen_addr),
            ("edge.listenAddr", &self.edge.listen_addr),
        ] {
            addr.parse::<SocketAddr>().map_err(|e| {
                AppError::Config(format!("Invalid {} '{}': {}", name, addr, e))
            })?;
        }

        if let Some(ProviderConfig::Ollama { endpoint, .. }) = self.get_provider_config(provider)
        {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(AppError::Config(format!(
                    "Ollama endpoint must be an http(s) URL: {}",
                    endpoint
                )));
            }
        }

        Ok(())
    }
}

impl QueueSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl GatewaySettings {
    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_interval_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl WorkerSettings {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl EdgeSettings {
    /// Clamp a caller-requested poll wait to the configured cap.
    pub fn poll_wait(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_poll_wait_ms)
            .min(self.max_poll_wait_ms);
        Duration::from_millis(ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.queue.request_channel, "query_requests");
        assert_eq!(config.queue.response_channel, "query_responses");
        assert_eq!(config.queue.max_deliveries, 5);
        assert!(!config.verbose);
        assert!(!config.no_color);
    }

    #[test]
    fn test_queue_path_defaults_into_askq_dir() {
        let config = AppConfig::default();
        assert!(config.askq_dir().ends_with(".askq"));
        assert!(config.queue_path().ends_with(".askq/queue.db"));
    }

    #[test]
    fn test_with_overrides() {
        let config = AppConfig::default();
        let overridden = config.with_overrides(
            None,
            None,
            Some("echo".to_string()),
            Some("canned".to_string()),
            None,
            true,
            false,
        );

        assert_eq!(overridden.provider, "echo");
        assert_eq!(overridden.model, "canned");
        assert!(overridden.verbose);
        assert_eq!(overridden.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_validate_unknown_provider() {
        let mut config = AppConfig::default();
        config.provider = "unknown".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shared_channel() {
        let mut config = AppConfig::default();
        config.queue.response_channel = config.queue.request_channel.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut config = AppConfig::default();
        config.queue.max_deliveries = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gateway.reap_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gateway.stream_poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queue.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.answer_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_answer_timeout_below_visibility() {
        let mut config = AppConfig::default();
        config.queue.visibility_timeout_secs = 60;

        config.worker.answer_timeout_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("visibilityTimeoutSecs"));

        config.worker.answer_timeout_secs = 59;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_defaults() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_poll_wait_is_capped() {
        let edge = EdgeSettings::default();
        assert_eq!(edge.poll_wait(None), Duration::from_millis(250));
        assert_eq!(edge.poll_wait(Some(10)), Duration::from_millis(10));
        assert_eq!(edge.poll_wait(Some(u64::MAX)), Duration::from_millis(30_000));
    }

    #[test]
    fn test_merge_yaml_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
logging:
  level: warn
  format: json
queue:
  requestChannel: asks
  maxDeliveries: 3
worker:
  concurrency: 8
llm:
  activeProvider: echo
  systemPrompt: Answer briefly.
  providers:
    echo:
      prefix: "A: "
    ollama:
      endpoint: http://gpu-box:11434
      model: qwen2.5
"#
        )
        .unwrap();

        let merged = AppConfig::default().merge_yaml(file.path()).unwrap();
        assert_eq!(merged.log_level.as_deref(), Some("warn"));
        assert_eq!(merged.log_format, LogFormat::Json);
        assert_eq!(merged.queue.request_channel, "asks");
        assert_eq!(merged.queue.response_channel, "query_responses");
        assert_eq!(merged.queue.max_deliveries, 3);
        assert_eq!(merged.worker.concurrency, 8);
        assert_eq!(merged.provider, "echo");
        assert_eq!(merged.model, "echo");
        assert_eq!(merged.system_prompt(), Some("Answer briefly."));
        assert!(matches!(
            merged.get_provider_config("ollama"),
            Some(ProviderConfig::Ollama { .. })
        ));
    }
}
