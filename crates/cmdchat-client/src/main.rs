//! cmdchat binary — terminal client for the cmdchat relay.

mod backoff;
mod client;
mod history;
mod input;
mod render;
mod tls;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cmdchat_core::config::ENV_LOG_LEVEL;

use client::ClientOpts;
use render::RendererKind;

/// Terminal client for the cmdchat relay.
#[derive(Debug, Parser)]
#[command(name = "cmdchat", version)]
struct Args {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = 5050)]
    port: u16,

    /// Display name.
    #[arg(long, default_value = "anonymous")]
    name: String,

    /// Room to join.
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Auth token, if the server requires one.
    #[arg(long)]
    token: Option<String>,

    /// Output style.
    #[arg(long, value_enum, default_value_t = RendererKind::Rich)]
    renderer: RendererKind,

    /// Input buffer depth (lines queued across a reconnect).
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u16).range(10..=1000))]
    buffer_size: u16,

    /// Connect over TLS.
    #[arg(long)]
    tls: bool,

    /// Skip server certificate verification (testing only).
    #[arg(long, requires = "tls")]
    tls_insecure: bool,

    /// Trust this CA bundle instead of the system roots.
    #[arg(long, requires = "tls")]
    ca_file: Option<PathBuf>,

    /// Append received chat to this encrypted file.
    #[arg(long, requires = "history_passphrase")]
    history_file: Option<PathBuf>,

    /// Passphrase for the history file cipher.
    #[arg(long)]
    history_passphrase: Option<String>,

    /// Suppress status output while reconnecting.
    #[arg(long)]
    quiet_reconnect: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();

    let opts = ClientOpts {
        host: args.host,
        port: args.port,
        name: args.name,
        room: args.room,
        token: args.token,
        renderer: args.renderer,
        buffer_size: usize::from(args.buffer_size),
        tls: args.tls,
        tls_insecure: args.tls_insecure,
        ca_file: args.ca_file,
        history_file: args.history_file,
        history_passphrase: args.history_passphrase,
        quiet_reconnect: args.quiet_reconnect,
    };

    if let Err(e) = client::run(opts).await {
        tracing::error!(error = %format!("{e:#}"), "client failed");
        // Setup problems (history file, TLS material) are configuration
        // errors; everything else is runtime.
        let code = if e.downcast_ref::<history::HistoryError>().is_some() { 3 } else { 1 };
        std::process::exit(code);
    }
}

fn init_tracing() {
    let directive = std::env::var(ENV_LOG_LEVEL)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .init();
}
