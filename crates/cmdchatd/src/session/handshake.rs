//! Server side of the session handshake.
//!
//! AWAIT_HELLO → OPERATIONAL, any failure → TERMINATED. The `hello` and
//! `session-init` envelopes are the only plaintext on a session; everything
//! after is sealed with the session key delivered here.

use cmdchat_core::config::redact_token;
use cmdchat_core::crypto::{SealedCipher, SessionKey, WrapPublicKey};
use cmdchat_core::envelope::Envelope;
use cmdchat_core::frame::{read_frame, write_frame};
use cmdchat_core::sanitize;

use super::{unix_ms, Conn, SessionError};
use crate::server::ServerCtx;

/// The result of a completed handshake.
pub(super) struct Handshake {
    pub name: String,
    pub room: String,
    pub cipher: SealedCipher,
}

/// Drive the handshake on a fresh connection.
pub(super) async fn perform(
    stream: &mut Box<dyn Conn>,
    ctx: &ServerCtx,
    client_id: u64,
) -> Result<Handshake, SessionError> {
    let first = tokio::time::timeout(ctx.config.handshake_timeout(), read_frame(stream))
        .await
        .map_err(|_| SessionError::Timeout)??;
    let frame = first.ok_or_else(|| SessionError::Protocol("closed before hello".into()))?;

    let envelope =
        Envelope::decode(&frame).map_err(|e| SessionError::Protocol(e.to_string()))?;
    let Envelope::Hello { public_key, name, room, token } = envelope else {
        return Err(SessionError::Protocol(format!(
            "expected hello, got {}",
            envelope.kind()
        )));
    };

    if !ctx.config.tokens.is_empty() {
        let accepted = token.as_deref().is_some_and(|t| ctx.config.tokens.contains(t));
        if !accepted {
            let shown = token.as_deref().map(redact_token).unwrap_or_else(|| "<none>".into());
            tracing::warn!(client_id, token = %shown, "rejected hello token");
            send_plain(stream, &auth_error()).await.ok();
            return Err(SessionError::Auth);
        }
    }

    let name = sanitize::name(&name);
    let room = sanitize::room(&room);

    let peer_key = match WrapPublicKey::from_b64(&public_key) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(client_id, error = %e, "unusable public key in hello");
            let err = Envelope::Error {
                code: "handshake".into(),
                message: "public key must be 2048-bit RSA DER".into(),
            };
            send_plain(stream, &err).await.ok();
            return Err(SessionError::Protocol("unusable public key".into()));
        }
    };

    let session_key = SessionKey::generate();
    let wrapped_key = peer_key
        .wrap(&session_key)
        .map_err(|e| SessionError::Protocol(format!("key wrap failed: {e}")))?;

    let init = Envelope::SessionInit {
        wrapped_key,
        client_id,
        server_time: unix_ms(),
    };
    send_plain(stream, &init).await?;

    Ok(Handshake {
        name,
        room,
        cipher: SealedCipher::new(&session_key),
    })
}

fn auth_error() -> Envelope {
    Envelope::Error {
        code: "auth".into(),
        message: "missing or invalid token".into(),
    }
}

async fn send_plain(stream: &mut Box<dyn Conn>, envelope: &Envelope) -> Result<(), SessionError> {
    write_frame(stream, &envelope.encode()).await?;
    Ok(())
}
