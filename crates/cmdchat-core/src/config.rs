//! Server configuration and `CMDCHAT_*` environment overrides.
//!
//! Resolution order: CLI flags (applied by the binary) → environment
//! variables → protocol defaults. The protocol-level numbers (rate window,
//! heartbeat cadence, queue bound) are fields rather than constants so a
//! deployment sized for bulk traffic, or a test, can tune them; the defaults
//! are the protocol's.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Env var holding the comma-separated accepted tokens. Empty disables auth.
pub const ENV_TOKENS: &str = "CMDCHAT_TOKENS";

/// Env var for log verbosity, consulted before `RUST_LOG`.
pub const ENV_LOG_LEVEL: &str = "CMDCHAT_LOG_LEVEL";

/// Env var that disables metrics when set to `0`.
pub const ENV_METRICS: &str = "CMDCHAT_METRICS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port. 0 = OS-assigned (tests).
    pub port: u16,

    /// TLS certificate chain, PEM. Set both or neither.
    pub certfile: Option<PathBuf>,
    /// TLS private key, PEM.
    pub keyfile: Option<PathBuf>,

    /// Accepted handshake tokens. Empty disables the auth gate.
    pub tokens: HashSet<String>,

    /// Metrics snapshot interval in seconds. 0 disables.
    pub metrics_interval_secs: u64,

    /// Handshake deadline for the first client frame.
    pub handshake_timeout_ms: u64,
    /// Ping cadence.
    pub heartbeat_interval_ms: u64,
    /// Reap sessions whose last pong is older than this.
    pub heartbeat_timeout_ms: u64,
    /// Rate limiter sliding-window width.
    pub rate_window_ms: u64,
    /// Events allowed per rate window.
    pub rate_max_events: usize,
    /// Outbound queue bound per session.
    pub send_queue_bound: usize,
    /// How long a terminating session may keep draining queued writes.
    pub drain_deadline_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5050,
            certfile: None,
            keyfile: None,
            tokens: HashSet::new(),
            metrics_interval_secs: 0,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            rate_window_ms: 5_000,
            rate_max_events: 12,
            send_queue_bound: 256,
            drain_deadline_ms: 2_000,
        }
    }
}

impl ServerConfig {
    /// Apply `CMDCHAT_*` env overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENV_TOKENS) {
            self.tokens = parse_tokens(&raw);
        }
        if let Ok(v) = std::env::var(ENV_METRICS) {
            if v == "0" {
                self.metrics_interval_secs = 0;
            }
        }
    }

    /// Validate cross-field constraints. TLS needs both halves of the pair.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.certfile.is_some() != self.keyfile.is_some() {
            return Err(ConfigError::TlsPair);
        }
        if self.rate_max_events == 0 || self.send_queue_bound == 0 {
            return Err(ConfigError::ZeroBound);
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.certfile.is_some() && self.keyfile.is_some()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }
}

/// Parse the `CMDCHAT_TOKENS` format: comma-separated, whitespace-tolerant,
/// empty entries dropped.
pub fn parse_tokens(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Redact a token for logging: `first4…last4`. Short tokens are fully
/// masked rather than partially revealed.
pub fn redact_token(token: &str) -> String {
    if token.len() <= 8 {
        return "…".to_string();
    }
    format!("{}…{}", &token[..4], &token[token.len() - 4..])
}

/// Startup misconfiguration. Fatal to the process (exit 3).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--certfile and --keyfile must be set together")]
    TlsPair,

    #[error("rate limit and queue bounds must be non-zero")]
    ZeroBound,

    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("no certificate or key found in {0}")]
    BadPem(PathBuf),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}
