//! Encrypted chat history — optional, client-side only.
//!
//! File layout: a 16-byte random salt, then an append-only sequence of
//! length-prefixed records in the wire frame format. Each record is an
//! AES-256-GCM-sealed JSON object `{timestamp, room, sender, text}`; the
//! key is derived from the passphrase with Argon2id over the file's salt.
//! The server never sees this file and the passphrase never leaves the
//! client process.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use cmdchat_core::crypto::{SealedCipher, SessionKey, SESSION_KEY_LEN};
use cmdchat_core::frame::{read_frame_sync, write_frame_sync, FrameError};

const SALT_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("history file is corrupt: {0}")]
    Corrupt(String),

    #[error("record does not decrypt; wrong passphrase?")]
    BadPassphrase,

    #[error("passphrase key derivation failed")]
    Kdf,
}

impl From<FrameError> for HistoryError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => HistoryError::Io(io),
            other => HistoryError::Corrupt(other.to_string()),
        }
    }
}

/// One logged chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: u64,
    pub room: String,
    pub sender: String,
    pub text: String,
}

/// Appends encrypted records to a history file, creating it (with a fresh
/// salt) on first use.
pub struct HistoryWriter {
    file: File,
    cipher: SealedCipher,
}

impl HistoryWriter {
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, HistoryError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let salt = if file.metadata()?.len() == 0 {
            let mut salt = [0u8; SALT_LEN];
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut salt);
            file.write_all(&salt)?;
            salt
        } else {
            read_salt(&mut file)?
        };
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            cipher: derive_cipher(passphrase, &salt)?,
        })
    }

    pub fn append(&mut self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let plain = serde_json::to_vec(record)
            .map_err(|e| HistoryError::Corrupt(e.to_string()))?;
        let sealed = self
            .cipher
            .seal(&plain)
            .map_err(|_| HistoryError::Corrupt("seal failed".into()))?;
        write_frame_sync(&mut self.file, &sealed)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Decrypt every record in a history file.
pub fn read_all(path: &Path, passphrase: &str) -> Result<Vec<HistoryRecord>, HistoryError> {
    let mut file = File::open(path)?;
    let salt = read_salt(&mut file)?;
    let cipher = derive_cipher(passphrase, &salt)?;

    let mut records = Vec::new();
    while let Some(sealed) = read_frame_sync(&mut file)? {
        let plain = cipher.open(&sealed).map_err(|_| HistoryError::BadPassphrase)?;
        let record = serde_json::from_slice(&plain)
            .map_err(|e| HistoryError::Corrupt(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

fn read_salt(file: &mut File) -> Result<[u8; SALT_LEN], HistoryError> {
    file.seek(SeekFrom::Start(0))?;
    let mut salt = [0u8; SALT_LEN];
    file.read_exact(&mut salt)
        .map_err(|_| HistoryError::Corrupt("missing salt header".into()))?;
    Ok(salt)
}

fn derive_cipher(passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<SealedCipher, HistoryError> {
    let mut key = [0u8; SESSION_KEY_LEN];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|_| HistoryError::Kdf)?;
    Ok(SealedCipher::new(&SessionKey::from_bytes(key)))
}
