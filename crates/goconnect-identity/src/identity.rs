//! Agent identity store
//!
//! Loads or creates the agent's keypair and certificates under the secrets
//! directory:
//! - `ca.pem` / `ca.key`: self-signed ECDSA P-256 signing CA, 10 year validity
//! - `host.pem` / `host.key`: leaf signed by the CA, 1 year validity
//!
//! The leaf must carry the fixed `goconnect` DNS SAN used as the TLS server
//! name on every dial; a persisted leaf that lacks it (or that no longer
//! verifies against the current CA) is replaced on load.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};
use zeroize::Zeroizing;

use crate::error::{IdentityError, IdentityResult};

/// Fixed server name presented via SNI and required as a leaf DNS SAN.
pub const TLS_SERVER_NAME: &str = "goconnect";

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key";
const HOST_CERT_FILE: &str = "host.pem";
const HOST_KEY_FILE: &str = "host.key";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The agent's long-lived identity: signing CA plus host leaf.
pub struct Identity {
    ca_pem: String,
    leaf_pem: String,
    key_pem: Zeroizing<String>,
}

impl Identity {
    /// PEM of the signing CA certificate.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// PEM of the host leaf certificate.
    pub fn leaf_pem(&self) -> &str {
        &self.leaf_pem
    }

    /// PEM of the host private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Leaf certificate chain in DER form, as presented on the wire.
    pub fn cert_chain(&self) -> IdentityResult<Vec<CertificateDer<'static>>> {
        Ok(vec![first_cert_der(&self.leaf_pem)?])
    }

    /// Host private key in DER form.
    pub fn private_key(&self) -> IdentityResult<PrivateKeyDer<'static>> {
        let mut reader = std::io::Cursor::new(self.key_pem.as_bytes());
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| IdentityError::CertificateParse(e.to_string()))?
            .ok_or_else(|| IdentityError::CertificateParse("no private key block".into()))
    }

    /// Signing CA certificate in DER form.
    pub fn ca_der(&self) -> IdentityResult<CertificateDer<'static>> {
        first_cert_der(&self.ca_pem)
    }
}

/// Loads or creates identity material under a secrets directory.
pub struct IdentityStore {
    secrets_dir: PathBuf,
    server_name: String,
}

impl IdentityStore {
    /// Create a store rooted at the given secrets directory.
    pub fn new(secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
            server_name: TLS_SERVER_NAME.to_string(),
        }
    }

    /// Override the server name the leaf SAN set must carry.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Secrets directory this store persists into.
    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    /// Load the persisted identity, generating any missing or stale parts.
    ///
    /// Idempotent: a second call returns byte-identical material.
    pub fn load_or_create(&self) -> IdentityResult<Identity> {
        fs::create_dir_all(&self.secrets_dir).map_err(|e| IdentityError::SecretsUnavailable {
            path: self.secrets_dir.clone(),
            source: e,
        })?;

        let (ca_pem, ca_key_pem) = self.load_or_create_ca()?;
        let (leaf_pem, key_pem) = self.load_or_create_leaf(&ca_pem, &ca_key_pem)?;

        Ok(Identity {
            ca_pem,
            leaf_pem,
            key_pem,
        })
    }

    fn load_or_create_ca(&self) -> IdentityResult<(String, Zeroizing<String>)> {
        let cert_path = self.secrets_dir.join(CA_CERT_FILE);
        let key_path = self.secrets_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert = self.read_secret(&cert_path)?;
            let key = Zeroizing::new(self.read_secret(&key_path)?);
            // Reject unparseable material early rather than at handshake time.
            first_cert_der(&cert)?;
            KeyPair::from_pem(&key)?;
            debug!("loaded signing CA from {}", cert_path.display());
            return Ok((cert, key));
        }

        info!("generating signing CA under {}", self.secrets_dir.display());
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "GOConnect");
        dn.push(DnType::CommonName, "GOConnect Root CA");
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());

        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        let key_pem = Zeroizing::new(key.serialize_pem());

        self.write_cert(&cert_path, &cert_pem)?;
        self.write_secret(&key_path, &key_pem)?;
        Ok((cert_pem, key_pem))
    }

    fn load_or_create_leaf(
        &self,
        ca_pem: &str,
        ca_key_pem: &str,
    ) -> IdentityResult<(String, Zeroizing<String>)> {
        let cert_path = self.secrets_dir.join(HOST_CERT_FILE);
        let key_path = self.secrets_dir.join(HOST_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert = self.read_secret(&cert_path)?;
            let key = Zeroizing::new(self.read_secret(&key_path)?);
            if leaf_matches(&cert, ca_pem, &self.server_name) && KeyPair::from_pem(&key).is_ok() {
                debug!("loaded host leaf from {}", cert_path.display());
                return Ok((cert, key));
            }
            warn!(
                "host certificate missing '{}' SAN or stale against CA, regenerating",
                self.server_name
            );
        }

        let ca_key = KeyPair::from_pem(ca_key_pem)?;
        let ca_params = CertificateParams::from_ca_cert_pem(ca_pem)?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        info!("generating host leaf for '{}'", host);

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "GOConnect Agent");
        dn.push(DnType::CommonName, host.as_str());
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(random_serial());

        let mut sans = vec![SanType::DnsName(Ia5String::try_from(
            self.server_name.as_str(),
        )?)];
        if host != self.server_name {
            // Non-ASCII hostnames cannot appear in an IA5 SAN; skip them.
            if let Ok(name) = Ia5String::try_from(host.as_str()) {
                sans.push(SanType::DnsName(name));
            }
        }
        sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params.subject_alt_names = sans;

        let cert = params.signed_by(&key, &ca_cert, &ca_key)?;
        let cert_pem = cert.pem();
        let key_pem = Zeroizing::new(key.serialize_pem());

        self.write_cert(&cert_path, &cert_pem)?;
        self.write_secret(&key_path, &key_pem)?;
        Ok((cert_pem, key_pem))
    }

    fn read_secret(&self, path: &Path) -> IdentityResult<String> {
        fs::read_to_string(path).map_err(|e| IdentityError::SecretsUnavailable {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn write_cert(&self, path: &Path, pem: &str) -> IdentityResult<()> {
        fs::write(path, pem).map_err(|e| IdentityError::SecretsUnavailable {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn write_secret(&self, path: &Path, pem: &str) -> IdentityResult<()> {
        self.write_cert(path, pem)?;
        restrict_permissions(path).map_err(|e| IdentityError::SecretsUnavailable {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// True when the leaf carries the required DNS SAN and still verifies
/// against the current CA key.
fn leaf_matches(leaf_pem: &str, ca_pem: &str, server_name: &str) -> bool {
    let Ok(leaf_der) = first_cert_der(leaf_pem) else {
        return false;
    };
    let Ok(ca_der) = first_cert_der(ca_pem) else {
        return false;
    };
    let Ok((_, leaf)) = X509Certificate::from_der(&leaf_der) else {
        return false;
    };
    let Ok((_, ca)) = X509Certificate::from_der(&ca_der) else {
        return false;
    };

    let has_san = match leaf.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .any(|gn| matches!(gn, GeneralName::DNSName(name) if *name == server_name)),
        _ => false,
    };

    has_san && leaf.verify_signature(Some(ca.public_key())).is_ok()
}

fn first_cert_der(pem: &str) -> IdentityResult<CertificateDer<'static>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| IdentityError::CertificateParse("no certificate block".into()))?
        .map_err(|e| IdentityError::CertificateParse(e.to_string()));
    cert
}

fn random_serial() -> SerialNumber {
    SerialNumber::from(rand::random::<u64>().to_be_bytes().to_vec())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());

        let first = store.load_or_create().unwrap();
        let second = store.load_or_create().unwrap();

        assert_eq!(first.ca_pem(), second.ca_pem());
        assert_eq!(first.leaf_pem(), second.leaf_pem());
        assert_eq!(first.key_pem(), second.key_pem());
    }

    #[test]
    fn test_leaf_carries_required_san() {
        let dir = tempfile::tempdir().unwrap();
        let identity = IdentityStore::new(dir.path()).load_or_create().unwrap();

        assert!(leaf_matches(
            identity.leaf_pem(),
            identity.ca_pem(),
            TLS_SERVER_NAME
        ));
    }

    #[test]
    fn test_legacy_leaf_without_san_is_replaced() {
        let dir = tempfile::tempdir().unwrap();

        // Persist a leaf whose SAN set lacks the mandatory name.
        let legacy = IdentityStore::new(dir.path()).with_server_name("legacy-name");
        let old = legacy.load_or_create().unwrap();

        let store = IdentityStore::new(dir.path());
        let fresh = store.load_or_create().unwrap();

        assert_eq!(old.ca_pem(), fresh.ca_pem());
        assert_ne!(old.leaf_pem(), fresh.leaf_pem());
        assert!(leaf_matches(
            fresh.leaf_pem(),
            fresh.ca_pem(),
            TLS_SERVER_NAME
        ));
    }

    #[test]
    fn test_leaf_regenerated_on_ca_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let old = store.load_or_create().unwrap();

        // Simulate CA rotation: remove the CA pair but keep the old leaf.
        fs::remove_file(dir.path().join(CA_CERT_FILE)).unwrap();
        fs::remove_file(dir.path().join(CA_KEY_FILE)).unwrap();

        let fresh = store.load_or_create().unwrap();
        assert_ne!(old.ca_pem(), fresh.ca_pem());
        assert_ne!(old.leaf_pem(), fresh.leaf_pem());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        IdentityStore::new(dir.path()).load_or_create().unwrap();

        for file in [CA_KEY_FILE, HOST_KEY_FILE] {
            let mode = fs::metadata(dir.path().join(file)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{file} should be owner read/write only");
        }
    }
}
