//! On-disk CA and server identity
//!
//! Layout of the state directory:
//!
//! | File | Content |
//! |------|---------|
//! | `ca.crt` / `ca.key` | active (signing) CA |
//! | `ca-trust.crt` | older CA certificates still trusted for validation |
//! | `server.crt` / `server.key` | listener TLS identity, signed by the active CA |
//!
//! Missing files are generated on first start. Existing files are never
//! overwritten.

use std::fs;
use std::path::Path;

use tracing::info;
use zeroize::Zeroizing;

use crate::mtls::ServerMtlsConfig;
use crate::pki::{parse_pem_many, CertificateAuthority, CertificateAuthorityBundle, PkiError, Result};

/// Active CA certificate
pub const CA_CERT_FILE: &str = "ca.crt";
/// Active CA key
pub const CA_KEY_FILE: &str = "ca.key";
/// Additional trusted CA certificates
pub const CA_TRUST_FILE: &str = "ca-trust.crt";
/// Listener certificate
pub const SERVER_CERT_FILE: &str = "server.crt";
/// Listener key
pub const SERVER_KEY_FILE: &str = "server.key";

/// Common name of a freshly generated CA
pub const DEFAULT_CA_NAME: &str = "tunnelmux agent CA";

/// CA bundle plus the listener's TLS identity
pub struct PkiMaterial {
    /// Signing and trusted CAs
    pub bundle: CertificateAuthorityBundle,
    /// Listener certificate PEM
    pub server_cert_pem: String,
    /// Listener key PEM
    pub server_key_pem: Zeroizing<String>,
}

impl PkiMaterial {
    /// Listener TLS configuration advertising the bundle's CAs
    pub fn server_tls(&self) -> ServerMtlsConfig {
        ServerMtlsConfig::new(
            self.server_cert_pem.clone(),
            self.server_key_pem.clone(),
            self.bundle.trust_bundle_pem(),
        )
    }
}

/// Load the CA bundle and server identity from `state_dir`, generating
/// whatever is missing
///
/// `sans` are used only when a new server certificate has to be generated.
pub fn load_or_create(state_dir: &Path, sans: &[&str]) -> Result<PkiMaterial> {
    fs::create_dir_all(state_dir)?;
    let bundle = load_or_create_ca(state_dir)?;

    let cert_path = state_dir.join(SERVER_CERT_FILE);
    let key_path = state_dir.join(SERVER_KEY_FILE);

    let (server_cert_pem, server_key_pem) = if cert_path.exists() && key_path.exists() {
        (
            fs::read_to_string(&cert_path)?,
            Zeroizing::new(fs::read_to_string(&key_path)?),
        )
    } else {
        let (cert, key) = bundle.active().generate_server_cert(sans)?;
        write_public(&cert_path, &cert)?;
        write_private(&key_path, &key)?;
        info!(path = %cert_path.display(), ?sans, "Generated server certificate");
        (cert, Zeroizing::new(key))
    };

    Ok(PkiMaterial {
        bundle,
        server_cert_pem,
        server_key_pem,
    })
}

/// Load the CA bundle from `state_dir`, creating a CA if none exists
pub fn load_or_create_ca(state_dir: &Path) -> Result<CertificateAuthorityBundle> {
    let cert_path = state_dir.join(CA_CERT_FILE);
    let key_path = state_dir.join(CA_KEY_FILE);

    if !cert_path.exists() || !key_path.exists() {
        let ca = CertificateAuthority::new(DEFAULT_CA_NAME)?;
        fs::create_dir_all(state_dir)?;
        write_public(&cert_path, ca.ca_cert_pem())?;
        write_private(&key_path, ca.ca_key_pem())?;
        info!(path = %cert_path.display(), "Created new certificate authority");
        return Ok(CertificateAuthorityBundle::new(ca));
    }

    let cert_pem = fs::read_to_string(&cert_path)?;
    let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
    let active = CertificateAuthority::from_pem(&cert_pem, &key_pem)?;
    let mut cas = vec![active];

    let trust_path = state_dir.join(CA_TRUST_FILE);
    if trust_path.exists() {
        let trust_pem = fs::read_to_string(&trust_path)?;
        for der in parse_pem_many(&trust_pem)? {
            // trust-only: the active key is a placeholder, these never sign
            let pem = crate::pki::cert_der_to_pem(&der);
            cas.push(CertificateAuthority::from_pem(&pem, &key_pem)?);
        }
        info!(count = cas.len() - 1, "Loaded additional trusted CAs");
    }

    CertificateAuthorityBundle::from_cas(cas)
}

fn write_public(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(PkiError::from)
}

fn write_private(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: first start creates everything, second start loads the same CA
    #[test]
    fn story_state_dir_bootstrap_is_stable() {
        let dir = tempfile::tempdir().expect("tempdir should be created");

        let first = load_or_create(dir.path(), &["localhost"]).expect("bootstrap should succeed");
        for file in [CA_CERT_FILE, CA_KEY_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE] {
            assert!(dir.path().join(file).exists(), "{} should exist", file);
        }

        let second = load_or_create(dir.path(), &["other"]).expect("reload should succeed");
        assert_eq!(
            first.bundle.active().ca_cert_pem(),
            second.bundle.active().ca_cert_pem()
        );
        assert_eq!(first.server_cert_pem, second.server_cert_pem);
        assert!(second.server_tls().to_rustls_config().is_ok());
    }

    #[test]
    fn trust_file_adds_verification_only_cas() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        load_or_create_ca(dir.path()).expect("CA should be created");

        let old = CertificateAuthority::new("Old CA").expect("CA creation should succeed");
        fs::write(dir.path().join(CA_TRUST_FILE), old.ca_cert_pem()).expect("write trust file");

        let bundle = load_or_create_ca(dir.path()).expect("CA should load");
        assert_eq!(bundle.len(), 2);
        let trusted = parse_pem_many(&bundle.trust_bundle_pem()).expect("bundle parses");
        let old_der = crate::pki::parse_pem(old.ca_cert_pem()).expect("old CA parses");
        assert_eq!(trusted[1], old_der);
    }

    #[cfg(unix)]
    #[test]
    fn private_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir should be created");
        load_or_create(dir.path(), &["localhost"]).expect("bootstrap should succeed");

        for file in [CA_KEY_FILE, SERVER_KEY_FILE] {
            let mode = fs::metadata(dir.path().join(file))
                .expect("metadata should be readable")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{} mode", file);
        }
    }

    #[test]
    fn corrupt_ca_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        fs::write(dir.path().join(CA_CERT_FILE), "garbage").expect("write");
        fs::write(dir.path().join(CA_KEY_FILE), "garbage").expect("write");
        assert!(load_or_create_ca(dir.path()).is_err());
    }
}
