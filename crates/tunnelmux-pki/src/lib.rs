//! Certificate authority adapter and TLS configuration for agent tunnels
//!
//! - [`pki`]: CA creation and loading, agent CSR signing, agent certificate
//!   validation and OU/CN identity extraction
//! - [`mtls`]: rustls server and client configurations
//! - [`store`]: CA and server identity persisted in a state directory

#![deny(missing_docs)]

pub mod mtls;
pub mod pki;
pub mod store;

pub use mtls::{ClientMtlsConfig, MtlsError, OptionalClientCertVerifier, ServerMtlsConfig};
pub use pki::{
    cert_der_to_pem, parse_pem, parse_pem_many, verify_agent_cert, AgentCertRequest,
    AgentIdentity, AgentSubject, CertificateAuthority, CertificateAuthorityBundle,
    CertificateInfo, IssuedCertificate, PkiError, VerificationResult, AGENT_CERT_VALIDITY_DAYS,
};
pub use store::{load_or_create, load_or_create_ca, PkiMaterial};
