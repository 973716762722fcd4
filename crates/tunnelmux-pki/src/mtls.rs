//! rustls configuration for the tunnel listener and for agent-side clients
//!
//! The listener asks for a client certificate but does not require one.
//! An agent without a certificate, or with one this server did not issue,
//! still completes the handshake and is admitted as unbound. Whether a
//! presented certificate binds the tunnel to a node is decided after the
//! handshake by [`crate::CertificateAuthorityBundle::verify_agent_cert`].

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::pki::parse_pem_many;

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// Key parsing error
    #[error("key parsing error: {0}")]
    KeyParseError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    /// Missing certificate
    #[error("missing certificate")]
    MissingCertificate,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, MtlsError> {
    let certs = parse_pem_many(pem)
        .map_err(|e| MtlsError::CertificateParseError(e.to_string()))?
        .into_iter()
        .map(CertificateDer::from)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(MtlsError::MissingCertificate);
    }
    Ok(certs)
}

fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>, MtlsError> {
    let parsed =
        ::pem::parse(pem.as_bytes()).map_err(|e| MtlsError::KeyParseError(e.to_string()))?;
    if parsed.tag() != "PRIVATE KEY" {
        return Err(MtlsError::KeyParseError(format!(
            "expected a PKCS#8 PRIVATE KEY block, got {}",
            parsed.tag()
        )));
    }
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        parsed.into_contents(),
    )))
}

fn root_store(pem: &str) -> Result<RootCertStore, MtlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(pem)? {
        roots
            .add(cert)
            .map_err(|e| MtlsError::CertificateParseError(e.to_string()))?;
    }
    Ok(roots)
}

/// Client certificate verifier that requests but never requires a certificate
///
/// Any presented certificate is accepted at the TLS layer; the handshake
/// signature is still checked so the client proves it holds the key.
#[derive(Debug)]
pub struct OptionalClientCertVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    schemes: Vec<SignatureScheme>,
}

impl OptionalClientCertVerifier {
    /// Create a verifier that advertises `trust_bundle_pem` as acceptable issuers
    pub fn new(trust_bundle_pem: &str) -> Result<Self, MtlsError> {
        let roots = root_store(trust_bundle_pem)?;
        let inner = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .allow_unauthenticated()
            .build()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;

        Ok(Self {
            schemes: inner.supported_verify_schemes(),
            inner,
        })
    }
}

impl ClientCertVerifier for OptionalClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        debug!("accepting presented client certificate for post-handshake validation");
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

/// Server-side TLS configuration for the tunnel listener
pub struct ServerMtlsConfig {
    /// Server certificate PEM
    pub server_cert_pem: String,
    /// Server private key PEM (zeroized on drop)
    pub server_key_pem: Zeroizing<String>,
    /// CA certificates advertised to clients
    pub trust_bundle_pem: String,
}

impl ServerMtlsConfig {
    /// Create a new server config
    pub fn new(
        server_cert_pem: String,
        server_key_pem: Zeroizing<String>,
        trust_bundle_pem: String,
    ) -> Self {
        Self {
            server_cert_pem,
            server_key_pem,
            trust_bundle_pem,
        }
    }

    /// Build a rustls ServerConfig
    pub fn to_rustls_config(&self) -> Result<Arc<ServerConfig>, MtlsError> {
        let verifier = Arc::new(OptionalClientCertVerifier::new(&self.trust_bundle_pem)?);
        let certs = load_certs(&self.server_cert_pem)?;
        let key = load_key(&self.server_key_pem)?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;

        Ok(Arc::new(config))
    }
}

/// Client-side TLS configuration, as an agent would use it
pub struct ClientMtlsConfig {
    /// Client certificate and key PEM, if the agent has one
    pub identity: Option<(String, Zeroizing<String>)>,
    /// CA certificate PEM for verifying the server
    pub ca_cert_pem: String,
}

impl ClientMtlsConfig {
    /// Client without a certificate
    pub fn anonymous(ca_cert_pem: String) -> Self {
        Self {
            identity: None,
            ca_cert_pem,
        }
    }

    /// Client presenting a certificate
    pub fn with_identity(
        client_cert_pem: String,
        client_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            identity: Some((client_cert_pem, client_key_pem)),
            ca_cert_pem,
        }
    }

    /// Build a rustls ClientConfig
    pub fn to_rustls_config(&self) -> Result<Arc<ClientConfig>, MtlsError> {
        let roots = root_store(&self.ca_cert_pem)?;
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_root_certificates(roots);

        let config = match &self.identity {
            Some((cert_pem, key_pem)) => builder
                .with_client_auth_cert(load_certs(cert_pem)?, load_key(key_pem)?)
                .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}
