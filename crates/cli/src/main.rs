//! askq CLI
//!
//! Main entry point for the askq command-line tool.
//! Runs the pieces of the query-dispatch fabric (gateway, workers, edge)
//! and provides a client for asking questions through it.

mod commands;

use askq_core::{config::AppConfig, logging, AppResult};
use clap::{Parser, Subcommand};
use commands::{AskCommand, EdgeCommand, GatewayCommand, QueueCommand, WorkerCommand};
use std::path::PathBuf;

/// askq - asynchronous question answering over a durable queue
#[derive(Parser, Debug)]
#[command(name = "askq")]
#[command(about = "Asynchronous question answering over a durable queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to workspace directory (default: current directory)
    #[arg(short, long, global = true, env = "ASKQ_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, global = true, env = "ASKQ_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    no_color: bool,

    /// LLM provider used by workers (ollama, echo)
    #[arg(short, long, global = true, env = "ASKQ_PROVIDER")]
    provider: Option<String>,

    /// Model identifier
    #[arg(short, long, global = true, env = "ASKQ_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatch gateway
    Gateway(GatewayCommand),

    /// Run a worker pool
    Worker(WorkerCommand),

    /// Run the edge API
    Edge(EdgeCommand),

    /// Ask a question through the edge
    Ask(AskCommand),

    /// Inspect the durable queue
    Queue(QueueCommand),
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Parse command-line arguments first (needed for logging config)
    let cli = Cli::parse();

    // Load base configuration from environment and config.yaml
    let config = AppConfig::load()?;

    // A config file named on the command line is merged on top
    let config = match cli.config.as_deref() {
        Some(path) if config.config_file.as_deref() != Some(path) => config.merge_yaml(path)?,
        _ => config,
    };

    // Apply CLI overrides
    let config = config.with_overrides(
        cli.workspace,
        cli.config,
        cli.provider,
        cli.model,
        cli.log_level,
        cli.verbose,
        cli.no_color,
    );

    // Initialize logging with final configuration
    logging::init_logging(config.log_level.as_deref(), config.log_format, config.no_color)?;

    tracing::info!("askq starting");
    tracing::debug!("Workspace: {:?}", config.workspace);
    tracing::debug!("Queue: {:?}", config.queue_path());

    config.validate()?;

    // Ensure .askq directory exists
    config.ensure_askq_dir()?;

    // Emit command span
    let command_name = match &cli.command {
        Commands::Gateway(_) => "gateway",
        Commands::Worker(_) => "worker",
        Commands::Edge(_) => "edge",
        Commands::Ask(_) => "ask",
        Commands::Queue(_) => "queue",
    };
    let _span = tracing::info_span!("command", name = command_name).entered();

    // Route to command handlers
    let result = match cli.command {
        Commands::Gateway(cmd) => cmd.execute(&config).await,
        Commands::Worker(cmd) => cmd.execute(&config).await,
        Commands::Edge(cmd) => cmd.execute(&config).await,
        Commands::Ask(cmd) => cmd.execute(&config).await,
        Commands::Queue(cmd) => cmd.execute(&config).await,
    };

    // Log completion
    match &result {
        Ok(_) => tracing::info!("Command completed successfully"),
        Err(e) => tracing::error!("Command failed: {}", e),
    }

    result
}
