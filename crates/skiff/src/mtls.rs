//! Auto-mTLS bootstrap.
//!
//! Each side generates an ephemeral self-signed identity for `localhost`.
//! The host passes its certificate to the plugin through the
//! `PLUGIN_CLIENT_CERT` environment variable; the plugin returns its own
//! leaf in the sixth handshake field. Each side then trusts exactly the
//! peer's certificate, so the session is authenticated in both directions
//! with no static configuration.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

use crate::error::{Result, SkiffError};

/// The name both ephemeral certificates are issued for, and the SNI value
/// used when dialing.
pub const TLS_SERVER_NAME: &str = "localhost";

/// An ephemeral keypair + self-signed certificate.
pub struct EphemeralIdentity {
    /// DER-encoded leaf certificate.
    pub cert_der: Vec<u8>,
    /// PEM rendering of the certificate, for the environment variable.
    pub cert_pem: String,
    /// PKCS#8 DER private key.
    key_der: Vec<u8>,
}

impl std::fmt::Debug for EphemeralIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralIdentity")
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

impl EphemeralIdentity {
    /// Generate a fresh identity for `CN=localhost`, usable as both a client
    /// and a server certificate. Marked CA-capable so the bare leaf can act
    /// as the peer's entire trust store.
    pub fn generate() -> Result<EphemeralIdentity> {
        let mut params = CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
            .map_err(tls_err("invalid certificate params"))?;
        params
            .distinguished_name
            .push(DnType::CommonName, TLS_SERVER_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let key_pair = KeyPair::generate().map_err(tls_err("key generation failed"))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(tls_err("self-signing failed"))?;

        Ok(EphemeralIdentity {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_der: key_pair.serialize_der(),
        })
    }

    fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    fn cert(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    /// The certificate encoded for the sixth handshake field: raw-standard
    /// base64 of the DER, no padding.
    pub fn handshake_field(&self) -> String {
        STANDARD_NO_PAD.encode(&self.cert_der)
    }
}

/// Decode a handshake certificate field back to DER.
pub fn decode_handshake_cert(field: &str) -> Result<Vec<u8>> {
    STANDARD_NO_PAD
        .decode(field.trim_end_matches('='))
        .map_err(|e| SkiffError::BadServerCert {
            message: e.to_string(),
        })
}

/// Decode the certificates in a PEM bundle (e.g. `PLUGIN_CLIENT_CERT`).
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::io::Result<_>>()
        .map_err(|e| SkiffError::Tls {
            message: format!("invalid PEM certificate: {e}"),
        })?;
    if certs.is_empty() {
        return Err(SkiffError::Tls {
            message: "PEM bundle contains no certificates".to_string(),
        });
    }
    Ok(certs)
}

/// Build the dialing half of a mutual-TLS pair: present `identity`, trust
/// exactly `peer_cert`.
pub fn client_config(
    identity: &EphemeralIdentity,
    peer_cert: &[u8],
) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(peer_cert.to_vec()))
        .map_err(tls_err("rejected peer certificate"))?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(vec![identity.cert()], identity.key())
        .map_err(tls_err("invalid client identity"))?;
    Ok(Arc::new(config))
}

/// Build the listening half of a mutual-TLS pair: present `identity`,
/// require clients to prove possession of `peer_certs`.
pub fn server_config(
    identity: &EphemeralIdentity,
    peer_certs: &[CertificateDer<'static>],
) -> Result<Arc<rustls::ServerConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in peer_certs {
        roots
            .add(cert.clone())
            .map_err(tls_err("rejected peer certificate"))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SkiffError::Tls {
            message: format!("failed to build client verifier: {e}"),
        })?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.cert()], identity.key())
        .map_err(tls_err("invalid server identity"))?;
    Ok(Arc::new(config))
}

/// The TLS configuration a session carries: the dialing half, the listening
/// half, or (with auto-mTLS) both, reused across brokered streams.
#[derive(Clone, Default)]
pub struct TlsContext {
    pub client: Option<Arc<rustls::ClientConfig>>,
    pub server: Option<Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl TlsContext {
    /// Build the full pair from our identity and the peer's DER leaf.
    pub fn mutual(identity: &EphemeralIdentity, peer_cert: &[u8]) -> Result<TlsContext> {
        Ok(TlsContext {
            client: Some(client_config(identity, peer_cert)?),
            server: Some(server_config(
                identity,
                &[CertificateDer::from(peer_cert.to_vec())],
            )?),
        })
    }

    /// A dial-only context from a static client configuration.
    pub fn client_only(config: Arc<rustls::ClientConfig>) -> TlsContext {
        TlsContext {
            client: Some(config),
            server: None,
        }
    }

    /// A listen-only context from a static server configuration.
    pub fn server_only(config: Arc<rustls::ServerConfig>) -> TlsContext {
        TlsContext {
            client: None,
            server: Some(config),
        }
    }
}

fn tls_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> SkiffError {
    move |e| SkiffError::Tls {
        message: format!("{context}: {e}"),
    }
}
