//! Certificate authority for agent tunnels
//!
//! The server acts as a CA and signs CSRs from agents. It never sees agent
//! private keys.
//!
//! # Agent certificate contract
//!
//! - `OU` is the node's persistent GUID
//! - `CN` is the tunnel GUID recorded on the node at issuance time
//! - `C` and `O` are copied from server configuration when set
//! - validity is [`AGENT_CERT_VALIDITY_DAYS`] from the moment of signing
//!
//! A reconnecting agent is bound only if its certificate chains to a CA in
//! the [`CertificateAuthorityBundle`] and its CN still matches the node.
//!
//! # CA rotation
//!
//! The bundle holds the active (signing) CA first and any older CAs after it.
//! All of them are trusted when validating agent certificates.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use uuid::Uuid;
use x509_parser::prelude::*;

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Validity period for the listener's server certificate (1 year)
pub const SERVER_CERT_VALIDITY_DAYS: i64 = 365;

/// Validity period for issued agent certificates
pub const AGENT_CERT_VALIDITY_DAYS: i64 = 365;

/// Returns (not_before, not_after) for a certificate starting now
fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(days);
    (now, not_after)
}

fn unix_now() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA not initialized
    #[error("CA not initialized")]
    CaNotInitialized,

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate is well-formed but does not carry an agent identity
    #[error("not an agent certificate: {0}")]
    NotAgentCertificate(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Parse every PEM block in `pem_data` and return their DER bytes
pub fn parse_pem_many(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(blocks.into_iter().map(|p| p.into_contents()).collect())
}

/// Validity window of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Full subject in RFC 4514 form
    pub subject: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            subject: cert.subject().to_string(),
        })
    }

    /// Seconds remaining until certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - unix_now()
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }
}

/// Identity carried by an agent certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Node GUID from the subject OU
    pub node_guid: Uuid,
    /// Tunnel GUID from the subject CN
    pub tunnel_guid: Uuid,
    /// Expiration (Unix timestamp)
    pub not_after: i64,
}

impl AgentIdentity {
    /// Extract OU and CN from a DER-encoded agent certificate
    ///
    /// Does not check the signature; see
    /// [`CertificateAuthorityBundle::verify_agent_cert`].
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
        Self::from_x509(&cert)
    }

    fn from_x509(cert: &X509Certificate<'_>) -> Result<Self> {
        let subject = cert.subject();
        let ou = subject
            .iter_organizational_unit()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .ok_or_else(|| PkiError::NotAgentCertificate("subject has no OU".to_string()))?;
        let cn = subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .ok_or_else(|| PkiError::NotAgentCertificate("subject has no CN".to_string()))?;

        let node_guid = Uuid::parse_str(ou).map_err(|_| {
            PkiError::NotAgentCertificate(format!("OU '{}' is not a GUID", ou))
        })?;
        let tunnel_guid = Uuid::parse_str(cn).map_err(|_| {
            PkiError::NotAgentCertificate(format!("CN '{}' is not a GUID", cn))
        })?;

        Ok(Self {
            node_guid,
            tunnel_guid,
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

/// Subject attributes for an agent certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSubject {
    /// Node GUID, written as OU
    pub node_guid: Uuid,
    /// Tunnel GUID, written as CN
    pub tunnel_guid: Uuid,
    /// Optional country attribute
    pub country: Option<String>,
    /// Optional organization attribute
    pub organization: Option<String>,
}

impl AgentSubject {
    fn distinguished_name(&self) -> Result<DistinguishedName> {
        let mut dn = DistinguishedName::new();
        if let Some(country) = &self.country {
            let printable = rcgen::string::PrintableString::try_from(country.as_str())
                .map_err(|e| {
                    PkiError::CertificateGenerationFailed(format!(
                        "invalid country '{}': {}",
                        country, e
                    ))
                })?;
            dn.push(DnType::CountryName, DnValue::PrintableString(printable));
        }
        if let Some(org) = &self.organization {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(self.node_guid.to_string()),
        );
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(self.tunnel_guid.to_string()),
        );
        Ok(dn)
    }
}

/// A certificate issued to an agent
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// DER-encoded certificate, as sent to the agent
    pub der: Vec<u8>,
    /// Subject in RFC 4514 form, as persisted on the node
    pub subject: String,
    /// Expiration (Unix timestamp)
    pub not_after: i64,
}

/// Certificate Authority for signing agent CSRs
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Validity of the CA certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Generate a TLS server certificate with the given SANs
    ///
    /// Returns (cert_pem, key_pem).
    pub fn generate_server_cert(&self, sans: &[&str]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(
                sans.first()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "tunnelmux server".to_string()),
            ),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(SERVER_CERT_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;
        let server_key_pem = server_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let server_cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok((server_cert.pem(), server_key_pem))
    }

    /// Sign a DER-encoded agent CSR
    ///
    /// Only the public key is taken from the CSR. Subject, validity and
    /// extensions all come from `subject` and this CA.
    pub fn sign_agent_csr(&self, csr_der: &[u8], subject: &AgentSubject) -> Result<IssuedCertificate> {
        if csr_der.is_empty() {
            return Err(PkiError::InvalidCsr("empty CSR".to_string()));
        }
        let csr_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
        let mut csr_params = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        csr_params.params.distinguished_name = subject.distinguished_name()?;
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        csr_params.params.subject_alt_names = Vec::new();

        let (not_before, not_after) = compute_validity(AGENT_CERT_VALIDITY_DAYS);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        let der = signed.der().to_vec();
        let info = CertificateInfo::from_der(&der)?;

        Ok(IssuedCertificate {
            der,
            subject: info.subject,
            not_after: info.not_after,
        })
    }
}

/// Bundle of CA certificates for verification during CA rotation
///
/// The active CA (index 0) signs new certificates. All CAs in the bundle
/// are trusted for verification.
#[derive(Clone)]
pub struct CertificateAuthorityBundle {
    cas: Vec<CertificateAuthority>,
}

impl CertificateAuthorityBundle {
    /// Create a new bundle with a single CA
    pub fn new(ca: CertificateAuthority) -> Self {
        Self { cas: vec![ca] }
    }

    /// Create a bundle from multiple CAs (first is the active/signing CA)
    pub fn from_cas(cas: Vec<CertificateAuthority>) -> Result<Self> {
        if cas.is_empty() {
            return Err(PkiError::CaNotInitialized);
        }
        Ok(Self { cas })
    }

    /// The signing CA
    pub fn active(&self) -> &CertificateAuthority {
        &self.cas[0]
    }

    /// All CA certificates as one PEM bundle
    pub fn trust_bundle_pem(&self) -> String {
        self.cas
            .iter()
            .map(|ca| ca.ca_cert_pem())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of CAs in the bundle
    pub fn len(&self) -> usize {
        self.cas.len()
    }

    /// Check if bundle is empty
    pub fn is_empty(&self) -> bool {
        self.cas.is_empty()
    }

    /// Sign an agent CSR with the active CA
    pub fn sign_agent_csr(&self, csr_der: &[u8], subject: &AgentSubject) -> Result<IssuedCertificate> {
        self.active().sign_agent_csr(csr_der, subject)
    }

    /// Verify a presented agent certificate against every CA in the bundle
    pub fn verify_agent_cert(&self, cert_der: &[u8]) -> Result<VerificationResult> {
        let mut last = None;
        for ca in &self.cas {
            match verify_agent_cert(cert_der, ca.ca_cert_pem()) {
                Ok(result) if result.valid => return Ok(result),
                Ok(result) => last = Some(result),
                Err(e) => return Err(e),
            }
        }
        Ok(last.unwrap_or_else(|| {
            VerificationResult::invalid("certificate not signed by any trusted CA")
        }))
    }
}

/// Outcome of validating an agent certificate
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Identity from OU/CN when the certificate is valid
    pub identity: Option<AgentIdentity>,
    /// Whether the certificate is valid
    pub valid: bool,
    /// Reason if invalid
    pub reason: Option<String>,
}

impl VerificationResult {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            identity: None,
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Verify an agent certificate was signed by `ca_cert_pem`, is in its
/// validity window, and carries GUIDs in OU and CN
///
/// Parse failures of the presented certificate are errors. Everything else
/// is reported through [`VerificationResult`].
pub fn verify_agent_cert(cert_der: &[u8], ca_cert_pem: &str) -> Result<VerificationResult> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse client cert: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(VerificationResult::invalid("signature verification failed"));
    }

    let now = unix_now();
    if now < cert.validity().not_before.timestamp() {
        return Ok(VerificationResult::invalid("certificate not yet valid"));
    }
    if now > cert.validity().not_after.timestamp() {
        return Ok(VerificationResult::invalid("certificate expired"));
    }

    match AgentIdentity::from_x509(&cert) {
        Ok(identity) => Ok(VerificationResult {
            identity: Some(identity),
            valid: true,
            reason: None,
        }),
        Err(e) => Ok(VerificationResult::invalid(e.to_string())),
    }
}

/// Agent certificate request (generates keypair and CSR locally)
///
/// This is what an agent does when the server asks it for a certificate
/// request. The private key never leaves this struct.
pub struct AgentCertRequest {
    key_pem: String,
    csr_pem: String,
    csr_der: Vec<u8>,
}

impl AgentCertRequest {
    /// Generate a new key pair and CSR
    pub fn new(common_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate agent key: {}", e))
        })?;

        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;

        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;
        let csr_der = csr.der().to_vec();

        Ok(Self {
            key_pem,
            csr_pem,
            csr_der,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// CSR in DER format, as carried in the CERTIFICATE_REQUEST field
    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Wrap a DER certificate in PEM
pub fn cert_der_to_pem(der: &[u8]) -> String {
    ::pem::encode_config(
        &::pem::Pem::new("CERTIFICATE", der.to_vec()),
        ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
    )
}
