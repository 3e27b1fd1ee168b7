use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use param_cascade::{
    backend::BackendClient,
    cli::{execute_command, SetCommands},
    config::{Config, LogFormat},
    server::{AppState, McpServer},
    storage::SqliteStorage,
};

/// Dependent dashboard parameters over MCP stdio.
#[derive(Parser, Debug)]
#[command(name = "param-cascade", version, about)]
struct Cli {
    /// Override LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override DATABASE_PATH
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Inspect saved parameter sets instead of serving
    #[command(subcommand)]
    command: Option<SetCommands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(path) = cli.database {
        config.database.path = path;
    }

    init_logging(&config);

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    if let Some(command) = cli.command {
        let result = execute_command(command, &storage).await;
        if result.exit_code == 0 {
            println!("{}", result.message);
        } else {
            eprintln!("{}", result.message);
        }
        std::process::exit(result.exit_code);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Param cascade server starting..."
    );

    let backend = match BackendClient::new(&config.backend, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.backend.base_url, "Backend client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize backend client");
            return Err(e.into());
        }
    };

    let state = Arc::new(AppState::new(config, storage, backend));
    let server = McpServer::new(state);

    info!("Server ready, waiting for requests on stdin...");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging on stderr; stdout carries the protocol
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
