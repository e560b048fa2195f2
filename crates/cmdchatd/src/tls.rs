//! TLS acceptor setup from a PEM cert/key pair.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use cmdchat_core::config::ConfigError;

/// Build a TLS acceptor from `--certfile` / `--keyfile`. Any failure here
/// is a startup configuration error (exit 3).
pub fn load_acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor, ConfigError> {
    let cert_pem = std::fs::read(certfile)
        .map_err(|e| ConfigError::ReadFailed(certfile.to_path_buf(), e))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|_| ConfigError::BadPem(certfile.to_path_buf()))?;
    if certs.is_empty() {
        return Err(ConfigError::BadPem(certfile.to_path_buf()));
    }

    let key_pem = std::fs::read(keyfile)
        .map_err(|e| ConfigError::ReadFailed(keyfile.to_path_buf(), e))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|_| ConfigError::BadPem(keyfile.to_path_buf()))?
        .ok_or_else(|| ConfigError::BadPem(keyfile.to_path_buf()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
