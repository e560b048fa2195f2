//! cmdchatd — the cmdchat relay daemon.
//!
//! Accepts framed connections (plain TCP or TLS), performs the key-wrap
//! handshake, and relays sealed envelopes between room members. Nothing is
//! persisted; a restart forgets every session, room, and transfer.

pub mod metrics;
pub mod rate;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod transfer;

pub use server::{Server, ServerError};
