//! TLS acceptors for SMTPS and HTTPS

use std::path::Path;
use tokio_native_tls::TlsAcceptor;
use tracing::debug;

use crate::error::{Result, VigilError};

/// Builds an acceptor from a PEM certificate chain and PKCS#8 PEM key
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert = std::fs::read(cert_path).map_err(|e| {
        VigilError::ConfigError(format!(
            "cannot read certificate {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let key = std::fs::read(key_path).map_err(|e| {
        VigilError::ConfigError(format!("cannot read key {}: {}", key_path.display(), e))
    })?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;
    debug!("Loaded TLS identity from {}", cert_path.display());
    Ok(TlsAcceptor::from(acceptor))
}
