//! The accept loop and shared server context.
//!
//! `Server::bind` validates configuration, loads TLS when configured, and
//! binds the listener; `Server::run` accepts connections and supervises one
//! task per session until shutdown. Shutdown is a broadcast: the accept
//! loop stops, every session terminates in parallel (each with its own
//! drain deadline), and `run` returns once the last one is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use cmdchat_core::config::{ConfigError, ServerConfig};

use crate::metrics::{self, Metrics};
use crate::registry::Registry;
use crate::session::{self, Conn};
use crate::tls;

/// Startup failures, split so the binary can map them to exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

/// State shared by every task of one server instance. Passed by reference;
/// there are no process-wide singletons.
pub struct ServerCtx {
    pub config: ServerConfig,
    pub registry: Registry,
    pub metrics: Metrics,
    next_client_id: AtomicU64,
}

impl ServerCtx {
    fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            metrics: Metrics::new(),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Monotonic client ids, unique for the process lifetime.
    pub fn allocate_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Server {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<ServerCtx>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Validate config, load TLS if configured, bind the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let acceptor = match (&config.certfile, &config.keyfile) {
            (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };

        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ServerError::Bind(bind_addr.clone(), e))?;
        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or(bind_addr),
            tls = acceptor.is_some(),
            "listening"
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            acceptor,
            ctx: ServerCtx::new(config),
            shutdown_tx,
        })
    }

    /// The bound address; useful when the port was OS-assigned.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for triggering a graceful shutdown from outside `run`.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept and supervise sessions until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let Server { listener, acceptor, ctx, shutdown_tx } = self;

        if ctx.config.metrics_interval_secs > 0 {
            tokio::spawn(metrics::report_loop(ctx.clone(), shutdown_tx.subscribe()));
        }

        let mut sessions = JoinSet::new();
        let mut shutdown_rx = shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,

                // Reap finished session tasks as they go.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    stream.set_nodelay(true).ok();
                    tracing::debug!(peer = %peer, "connection accepted");

                    let ctx = ctx.clone();
                    let acceptor = acceptor.clone();
                    let shutdown = shutdown_tx.subscribe();
                    sessions.spawn(async move {
                        let conn: Box<dyn Conn> = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Box::new(tls_stream),
                                Err(e) => {
                                    tracing::warn!(peer = %peer, error = %e, "TLS accept failed");
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };
                        session::run_connection(conn, ctx, shutdown).await;
                    });
                }
            }
        }

        drop(listener);
        tracing::info!(active = sessions.len(), "shutting down, terminating sessions");
        while sessions.join_next().await.is_some() {}
        tracing::info!("shutdown complete");
        Ok(())
    }
}
