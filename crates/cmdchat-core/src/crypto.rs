//! Cryptographic primitives for cmdchat.
//!
//! Two pieces:
//!   1. Key wrap — RSA-2048 with OAEP/SHA-256 padding, used exactly once per
//!      session to deliver the server-generated session key to the client.
//!   2. Session cipher — AES-256-GCM with a fresh random 96-bit nonce per
//!      encryption; every post-handshake frame payload is
//!      `nonce(12) || ciphertext || tag(16)`.
//!
//! Public keys travel as base64 SubjectPublicKeyInfo DER. Session keys live
//! in `Zeroizing` buffers and are wiped when dropped. There is no unsafe
//! code in this module.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Session key length in bytes (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Required key-wrap modulus size in bits.
pub const WRAP_KEY_BITS: usize = 2048;

/// Errors from key handling and sealed-envelope processing.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("keypair generation failed: {0}")]
    KeyGen(rsa::Error),

    #[error("public key does not parse")]
    BadPublicKey,

    #[error("public key is {0} bits, expected {WRAP_KEY_BITS}")]
    BadKeySize(usize),

    #[error("key wrap failed: {0}")]
    Wrap(rsa::Error),

    #[error("key unwrap failed")]
    Unwrap,

    #[error("encryption failed")]
    Encrypt,

    #[error("authenticated decryption failed")]
    Decrypt,

    #[error("sealed payload too short ({0} bytes, need at least {})", NONCE_LEN + TAG_LEN)]
    TooShort(usize),
}

// ── Session key ───────────────────────────────────────────────────────────────

/// A 256-bit symmetric session key. Generated server-side, delivered to the
/// client wrapped, never transmitted in plaintext, never logged.
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_LEN]>);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"<redacted>").finish()
    }
}

impl SessionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        OsRng.fill_bytes(&mut *bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn as_slice(&self) -> &[u8] {
        &*self.0
    }
}

// ── Key wrap ──────────────────────────────────────────────────────────────────

/// The client-side keypair used for one handshake. A fresh pair is generated
/// per connection attempt; the private half never leaves this struct.
pub struct WrapKeypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl WrapKeypair {
    /// Generate a new RSA-2048 keypair. This is CPU-bound (hundreds of
    /// milliseconds); callers on an async runtime should use
    /// `spawn_blocking`.
    pub fn generate() -> Result<Self, CryptoError> {
        let private =
            RsaPrivateKey::new(&mut rand::thread_rng(), WRAP_KEY_BITS).map_err(CryptoError::KeyGen)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// The public half as base64 DER, ready for a `hello` envelope.
    pub fn public_b64(&self) -> Result<String, CryptoError> {
        use rsa::pkcs8::EncodePublicKey;
        let der = self
            .public
            .to_public_key_der()
            .map_err(|_| CryptoError::BadPublicKey)?;
        Ok(B64.encode(der.as_bytes()))
    }

    /// Unwrap a session key from a `session-init` envelope.
    pub fn unwrap_key(&self, wrapped_b64: &str) -> Result<SessionKey, CryptoError> {
        let wrapped = B64.decode(wrapped_b64).map_err(|_| CryptoError::Unwrap)?;
        let plain = self
            .private
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|_| CryptoError::Unwrap)?;
        let bytes: [u8; SESSION_KEY_LEN] =
            plain.as_slice().try_into().map_err(|_| CryptoError::Unwrap)?;
        Ok(SessionKey::from_bytes(bytes))
    }
}

/// A peer's public wrap key, parsed from a `hello` envelope.
#[derive(Debug)]
pub struct WrapPublicKey(RsaPublicKey);

impl WrapPublicKey {
    /// Parse from base64 DER and enforce the 2048-bit modulus requirement.
    pub fn from_b64(encoded: &str) -> Result<Self, CryptoError> {
        use rsa::pkcs8::DecodePublicKey;
        let der = B64.decode(encoded).map_err(|_| CryptoError::BadPublicKey)?;
        let key = RsaPublicKey::from_public_key_der(&der).map_err(|_| CryptoError::BadPublicKey)?;
        let bits = key.size() * 8;
        if bits != WRAP_KEY_BITS {
            return Err(CryptoError::BadKeySize(bits));
        }
        Ok(Self(key))
    }

    /// Wrap a session key for the holder of the matching private key.
    /// Returns base64 for a `session-init` envelope.
    pub fn wrap(&self, key: &SessionKey) -> Result<String, CryptoError> {
        let wrapped = self
            .0
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key.as_slice())
            .map_err(CryptoError::Wrap)?;
        Ok(B64.encode(wrapped))
    }
}

// ── Session cipher ────────────────────────────────────────────────────────────

/// The per-session authenticated cipher. Both directions of a session use
/// the same key; nonce uniqueness comes from fresh 96-bit randoms, which is
/// sound at this protocol's per-session message bound.
#[derive(Clone)]
pub struct SealedCipher {
    aead: Aes256Gcm,
}

impl SealedCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice())),
        }
    }

    /// Encrypt a plaintext envelope into a frame payload:
    /// `nonce(12) || ciphertext || tag(16)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt a frame payload. Fails closed on any tag mismatch; the
    /// session must be terminated on failure.
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort(payload.len()));
        }
        let (nonce, ct) = payload.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::Decrypt)
    }
}
