use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod capabilities;
mod config;

use config::{AppState, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "capflow")]
#[command(about = "Capability workflow node", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "capflow.toml", env = "CAPFLOW_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "CAPFLOW_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "CAPFLOW_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "capflow=info,capflow_core=info,tower_http=debug".into());

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("Starting Capflow node");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = NodeConfig::load(&args.config, args.data_dir)?;
    tracing::info!("Node {} hosting {} workflow(s)", config.node.peer_id, config.workflows.len());

    let state = AppState::new(&config).await?;

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    let served = api::serve(&addr, state.clone(), shutdown_signal()).await;

    tracing::info!("Shutting down workflow engines");
    state.shutdown().await;

    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_flag() {
        let args = Args::try_parse_from(["capflow"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Text);

        let args = Args::try_parse_from(["capflow", "--log-format", "json"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Json);

        assert!(Args::try_parse_from(["capflow", "--log-format", "xml"]).is_err());
    }
}
