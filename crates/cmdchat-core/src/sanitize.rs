//! Sanitization rules for names, rooms, and chat text.
//!
//! Applied server-side before any value reaches the registry or a broadcast,
//! and client-side before values are offered in a `hello`. Both sides apply
//! the same rules so a round trip is idempotent.

/// Maximum display-name length in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum room-name length in characters.
pub const MAX_ROOM_LEN: usize = 32;

/// Maximum chat message length in bytes.
pub const MAX_MESSAGE_BYTES: usize = 4096;

/// Fallback display name for an empty result.
pub const DEFAULT_NAME: &str = "anonymous";

/// Fallback room for an empty result.
pub const DEFAULT_ROOM: &str = "lobby";

/// A chat message that violates the protocol's message bounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message of {0} bytes exceeds maximum {MAX_MESSAGE_BYTES}")]
    Oversize(usize),
}

/// Sanitize a display name: keep `[A-Za-z0-9 _-]`, lowercase, trim to
/// [`MAX_NAME_LEN`]; empty results become [`DEFAULT_NAME`].
pub fn name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        cleaned
    }
}

/// Sanitize a room name: like [`name`] but spaces are disallowed and the
/// fallback is [`DEFAULT_ROOM`]. The result matches `[a-z0-9_-]{1,32}`.
pub fn room(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_ROOM_LEN)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_ROOM.to_string()
    } else {
        cleaned
    }
}

/// Sanitize a chat message: strip control characters other than newline and
/// tab. Messages over [`MAX_MESSAGE_BYTES`] are a protocol violation, not
/// something to quietly truncate.
pub fn message(raw: &str) -> Result<String, MessageError> {
    if raw.len() > MAX_MESSAGE_BYTES {
        return Err(MessageError::Oversize(raw.len()));
    }
    Ok(raw
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect())
}
