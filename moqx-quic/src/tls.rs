//! TLS configuration for the QUIC engine.
//!
//! The server generates a self-signed certificate at startup with `rcgen`
//! and publishes its DER bytes (the agent writes them to a file). The
//! client pins exactly that certificate in its trust store, so no CA is
//! involved.

use std::path::Path;
use std::sync::Arc;

// ---

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

// ---

use crate::error::QuicError;

/// ALPN token both sides must offer.
pub const ALPN: &[u8] = b"moqx";

// ---------------------------------------------------------------------------
// CertBundle
// ---------------------------------------------------------------------------

/// A self-signed TLS certificate and its private key.
pub struct CertBundle {
    // ---
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
}

impl CertBundle {
    // ---
    /// Generate a certificate valid for `server_name`. Clients must connect
    /// with the same name.
    pub fn generate(server_name: &str) -> Result<Self, QuicError> {
        // ---
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(|e| QuicError::Tls(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.cert);
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        Ok(Self { cert_der, key_der })
    }

    /// Write the certificate (not the key) for clients to pin.
    pub fn write_cert(&self, path: &Path) -> Result<(), QuicError> {
        std::fs::write(path, self.cert_der.as_ref())?;
        Ok(())
    }
}

/// Load a certificate written by [`CertBundle::write_cert`].
pub fn read_cert(path: &Path) -> Result<CertificateDer<'static>, QuicError> {
    // ---
    let der = std::fs::read(path)?;
    if der.is_empty() {
        return Err(QuicError::Tls(format!("{} is empty", path.display())));
    }
    Ok(CertificateDer::from(der))
}

// ---------------------------------------------------------------------------
// Server TLS config
// ---------------------------------------------------------------------------

pub(crate) fn server_config(bundle: &CertBundle) -> Result<rustls::ServerConfig, QuicError> {
    // ---
    let mut cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![bundle.cert_der.clone()],
            PrivateKeyDer::Pkcs8(bundle.key_der.clone_key()),
        )
        .map_err(|e| QuicError::Tls(e.to_string()))?;

    cfg.alpn_protocols = vec![ALPN.to_vec()];
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Client TLS config
// ---------------------------------------------------------------------------

/// Build a client config that trusts only `server_cert_der`.
pub(crate) fn client_config(server_cert_der: CertificateDer<'static>) -> Result<rustls::ClientConfig, QuicError> {
    // ---
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(server_cert_der)
        .map_err(|e| QuicError::Tls(e.to_string()))?;

    let mut cfg = rustls::ClientConfig::builder()
        .with_root_certificates(Arc::new(roots))
        .with_no_client_auth();

    cfg.alpn_protocols = vec![ALPN.to_vec()];
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
