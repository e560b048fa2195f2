//! Envelope codec — the typed messages carried inside frames.
//!
//! An envelope on the wire is a UTF-8 block of newline-delimited `key=value`
//! records terminated by an empty line. The first record is always
//! `type=<kind>`. Values escape backslash, newline, and carriage return as
//! `\\`, `\n`, `\r`; binary fields (public keys, wrapped keys, chunk data)
//! are standard base64; integers are decimal.
//!
//! The set of envelope kinds is closed. Decoders require the keys their kind
//! needs, default the server-assigned ones, ignore unknown keys, and report
//! unknown kinds as [`EnvelopeError::UnknownType`] so the receiver can log
//! and drop them without tearing down the session.

use serde::Serialize;

/// File-chunk payload size in bytes, before base64 encoding.
pub const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Maximum declared file-transfer size.
pub const FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// A typed protocol message; the unit of dispatch on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// First client frame: identity and the key to wrap the session key with.
    Hello {
        public_key: String,
        name: String,
        room: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Server handshake reply. The last plaintext envelope on a session.
    SessionInit {
        wrapped_key: String,
        client_id: u64,
        server_time: u64,
    },
    /// A chat line. Clients send only `text`; the server fills the rest
    /// before broadcasting and ignores client-supplied values.
    Chat {
        sender: String,
        room: String,
        text: String,
        ts: u64,
        seq: u64,
    },
    /// Server-originated notice (joins, leaves, renames, backpressure).
    System { text: String },
    CmdNick { name: String },
    CmdJoin { room: String },
    CmdQuit,
    FileStart {
        sender: String,
        transfer_id: String,
        filename: String,
        size: u64,
        total_chunks: u32,
    },
    FileChunk {
        sender: String,
        transfer_id: String,
        index: u32,
        data: String,
    },
    FileEnd { sender: String, transfer_id: String },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Error { code: String, message: String },
}

/// Errors from decoding an envelope block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid UTF-8")]
    NotUtf8,

    #[error("envelope has no type record")]
    MissingType,

    #[error("unknown envelope type {0:?}")]
    UnknownType(String),

    #[error("envelope is missing required key {0:?}")]
    MissingKey(&'static str),

    #[error("envelope key {0:?} is not a valid integer")]
    BadInt(&'static str),

    #[error("malformed record {0:?}")]
    BadRecord(String),
}

impl Envelope {
    /// The wire name of this envelope's kind. Used for dispatch logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::SessionInit { .. } => "session-init",
            Envelope::Chat { .. } => "chat",
            Envelope::System { .. } => "system",
            Envelope::CmdNick { .. } => "cmd-nick",
            Envelope::CmdJoin { .. } => "cmd-join",
            Envelope::CmdQuit => "cmd-quit",
            Envelope::FileStart { .. } => "file-start",
            Envelope::FileChunk { .. } => "file-chunk",
            Envelope::FileEnd { .. } => "file-end",
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Error { .. } => "error",
        }
    }

    /// Encode to the kv-text block, ready to be framed (and sealed).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        push_record(&mut out, "type", self.kind());
        match self {
            Envelope::Hello { public_key, name, room, token } => {
                push_record(&mut out, "public_key", public_key);
                push_record(&mut out, "name", name);
                push_record(&mut out, "room", room);
                if let Some(token) = token {
                    push_record(&mut out, "token", token);
                }
            }
            Envelope::SessionInit { wrapped_key, client_id, server_time } => {
                push_record(&mut out, "wrapped_key", wrapped_key);
                push_record(&mut out, "client_id", &client_id.to_string());
                push_record(&mut out, "server_time", &server_time.to_string());
            }
            Envelope::Chat { sender, room, text, ts, seq } => {
                push_record(&mut out, "sender", sender);
                push_record(&mut out, "room", room);
                push_record(&mut out, "text", text);
                push_record(&mut out, "ts", &ts.to_string());
                push_record(&mut out, "seq", &seq.to_string());
            }
            Envelope::System { text } => {
                push_record(&mut out, "text", text);
            }
            Envelope::CmdNick { name } => {
                push_record(&mut out, "name", name);
            }
            Envelope::CmdJoin { room } => {
                push_record(&mut out, "room", room);
            }
            Envelope::CmdQuit => {}
            Envelope::FileStart { sender, transfer_id, filename, size, total_chunks } => {
                push_record(&mut out, "sender", sender);
                push_record(&mut out, "transfer_id", transfer_id);
                push_record(&mut out, "filename", filename);
                push_record(&mut out, "size", &size.to_string());
                push_record(&mut out, "total_chunks", &total_chunks.to_string());
            }
            Envelope::FileChunk { sender, transfer_id, index, data } => {
                push_record(&mut out, "sender", sender);
                push_record(&mut out, "transfer_id", transfer_id);
                push_record(&mut out, "index", &index.to_string());
                push_record(&mut out, "data", data);
            }
            Envelope::FileEnd { sender, transfer_id } => {
                push_record(&mut out, "sender", sender);
                push_record(&mut out, "transfer_id", transfer_id);
            }
            Envelope::Ping { nonce } => {
                push_record(&mut out, "nonce", &nonce.to_string());
            }
            Envelope::Pong { nonce } => {
                push_record(&mut out, "nonce", &nonce.to_string());
            }
            Envelope::Error { code, message } => {
                push_record(&mut out, "code", code);
                push_record(&mut out, "message", message);
            }
        }
        out.push('\n'); // empty-line terminator
        out.into_bytes()
    }

    /// Decode a kv-text block back into an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| EnvelopeError::NotUtf8)?;

        let mut kind = None;
        let mut fields: Vec<(&str, String)> = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                break; // terminator; anything after is ignored
            }
            let (key, raw) = line
                .split_once('=')
                .ok_or_else(|| EnvelopeError::BadRecord(line.to_string()))?;
            let value = unescape(raw).ok_or_else(|| EnvelopeError::BadRecord(line.to_string()))?;
            if key == "type" {
                kind.get_or_insert(value);
            } else {
                fields.push((key, value));
            }
        }

        let kind = kind.ok_or(EnvelopeError::MissingType)?;
        let fields = Fields(fields);

        let envelope = match kind.as_str() {
            "hello" => Envelope::Hello {
                public_key: fields.required("public_key")?,
                name: fields.required("name")?,
                room: fields.required("room")?,
                token: fields.optional("token"),
            },
            "session-init" => Envelope::SessionInit {
                wrapped_key: fields.required("wrapped_key")?,
                client_id: fields.required_int("client_id")?,
                server_time: fields.required_int("server_time")?,
            },
            "chat" => Envelope::Chat {
                sender: fields.optional("sender").unwrap_or_default(),
                room: fields.optional("room").unwrap_or_default(),
                text: fields.required("text")?,
                ts: fields.optional_int("ts")?,
                seq: fields.optional_int("seq")?,
            },
            "system" => Envelope::System { text: fields.required("text")? },
            "cmd-nick" => Envelope::CmdNick { name: fields.required("name")? },
            "cmd-join" => Envelope::CmdJoin { room: fields.required("room")? },
            "cmd-quit" => Envelope::CmdQuit,
            "file-start" => Envelope::FileStart {
                sender: fields.optional("sender").unwrap_or_default(),
                transfer_id: fields.required("transfer_id")?,
                filename: fields.required("filename")?,
                size: fields.required_int("size")?,
                total_chunks: fields.required_int("total_chunks")?,
            },
            "file-chunk" => Envelope::FileChunk {
                sender: fields.optional("sender").unwrap_or_default(),
                transfer_id: fields.required("transfer_id")?,
                index: fields.required_int("index")?,
                data: fields.required("data")?,
            },
            "file-end" => Envelope::FileEnd {
                sender: fields.optional("sender").unwrap_or_default(),
                transfer_id: fields.required("transfer_id")?,
            },
            "ping" => Envelope::Ping { nonce: fields.required_int("nonce")? },
            "pong" => Envelope::Pong { nonce: fields.required_int("nonce")? },
            "error" => Envelope::Error {
                code: fields.required("code")?,
                message: fields.optional("message").unwrap_or_default(),
            },
            other => return Err(EnvelopeError::UnknownType(other.to_string())),
        };
        Ok(envelope)
    }
}

struct Fields<'a>(Vec<(&'a str, String)>);

impl Fields<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
    }

    fn required(&self, key: &'static str) -> Result<String, EnvelopeError> {
        self.optional(key).ok_or(EnvelopeError::MissingKey(key))
    }

    fn required_int<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, EnvelopeError> {
        self.required(key)?.parse().map_err(|_| EnvelopeError::BadInt(key))
    }

    fn optional_int<T: std::str::FromStr + Default>(
        &self,
        key: &'static str,
    ) -> Result<T, EnvelopeError> {
        match self.optional(key) {
            Some(v) => v.parse().map_err(|_| EnvelopeError::BadInt(key)),
            None => Ok(T::default()),
        }
    }
}

fn push_record(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('\n');
}

/// Reverse [`push_record`]'s escaping. Returns `None` on a dangling or
/// unknown escape.
fn unescape(raw: &str) -> Option<String> {
    if !raw.contains('\\') {
        return Some(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}
