//! Secure channel setup for WebSocket listeners.

use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, pki_types::pem::PemObject};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use super::TlsFiles;
use crate::error::ProxyError;

fn secure_err(reason: impl Into<String>) -> ProxyError {
    ProxyError::SecureChannel {
        reason: reason.into(),
    }
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
///
/// Called once at `start`; a failure here fails the start rather than each
/// connection.
pub fn build_acceptor(files: &TlsFiles) -> Result<TlsAcceptor, ProxyError> {
    let certs = CertificateDer::pem_file_iter(&files.cert_path)
        .map_err(|e| secure_err(format!("{}: {e}", files.cert_path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| secure_err(format!("{}: {e}", files.cert_path.display())))?;
    if certs.is_empty() {
        return Err(secure_err(format!(
            "{}: no certificates found",
            files.cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(&files.key_path)
        .map_err(|e| secure_err(format!("{}: {e}", files.key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| secure_err(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| secure_err(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
