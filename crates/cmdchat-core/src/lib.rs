//! cmdchat-core — the cmdchat wire protocol.
//!
//! Everything both sides of a connection must agree on lives here:
//! length-prefixed framing, the envelope text encoding, the key-wrap and
//! session-cipher primitives, and the sanitization rules for names, rooms,
//! and message bodies. The server and client crates build their loops on
//! top of these pieces.

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod frame;
pub mod sanitize;
