//! cmdchatd binary — CLI parsing, logging setup, signal handling.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cmdchat_core::config::{ServerConfig, ENV_LOG_LEVEL};
use cmdchatd::{Server, ServerError};

/// In-memory multi-room chat relay.
#[derive(Debug, Parser)]
#[command(name = "cmdchatd", version)]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port.
    #[arg(long, default_value_t = 5050)]
    port: u16,

    /// TLS certificate chain (PEM). Requires --keyfile.
    #[arg(long, requires = "keyfile")]
    certfile: Option<PathBuf>,

    /// TLS private key (PEM). Requires --certfile.
    #[arg(long, requires = "certfile")]
    keyfile: Option<PathBuf>,

    /// Seconds between metrics snapshots. 0 disables.
    #[arg(long, default_value_t = 0)]
    metrics_interval: u64,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config = ServerConfig {
        host: args.host,
        port: args.port,
        certfile: args.certfile,
        keyfile: args.keyfile,
        metrics_interval_secs: args.metrics_interval,
        ..ServerConfig::default()
    };
    config.apply_env_overrides();

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(ServerError::Config(e)) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(3);
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown.send(());
    });

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}

fn init_tracing(cli_level: Option<&str>) {
    let directive = cli_level
        .map(str::to_string)
        .or_else(|| std::env::var(ENV_LOG_LEVEL).ok())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
