//! Trust anchor pool
//!
//! The pool seeds from the agent's own signing CA and appends operator
//! supplied entries, each either an inline PEM block or a filesystem path
//! (relative paths resolve against the secrets directory). The same pool
//! serves as the dialer's root-of-trust and the listener's client-auth root.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{IdentityError, IdentityResult};
use crate::identity::Identity;

const PEM_HEADER: &str = "-----BEGIN";

/// Deduplicated set of trust anchors.
#[derive(Debug)]
pub struct TrustPool {
    roots: RootCertStore,
    seen: HashSet<Vec<u8>>,
    subjects: BTreeSet<String>,
}

impl TrustPool {
    fn new() -> Self {
        Self {
            roots: RootCertStore::empty(),
            seen: HashSet::new(),
            subjects: BTreeSet::new(),
        }
    }

    /// Add one certificate; duplicates (by DER) are ignored.
    fn add(&mut self, der: CertificateDer<'static>, origin: &str) -> IdentityResult<()> {
        if !self.seen.insert(der.as_ref().to_vec()) {
            debug!("duplicate trust anchor from '{}' skipped", origin);
            return Ok(());
        }
        if let Ok((_, parsed)) = X509Certificate::from_der(der.as_ref()) {
            self.subjects.insert(parsed.subject().to_string());
        }
        self.roots
            .add(der)
            .map_err(|_| IdentityError::TrustEntryInvalid(origin.to_string()))
    }

    /// Number of distinct anchors in the pool.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// True when the pool holds no anchors.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Distinct certificate subjects, for observability.
    pub fn subjects(&self) -> &BTreeSet<String> {
        &self.subjects
    }

    /// Root store for rustls client/server configuration.
    pub fn root_store(&self) -> RootCertStore {
        self.roots.clone()
    }
}

/// Build the trust pool from the identity CA plus configured entries.
///
/// Any unreadable or unparseable entry is fatal: a half-loaded pool would
/// silently reject peers the operator meant to trust.
pub fn build_trust_pool(
    identity: &Identity,
    entries: &[String],
    secrets_dir: &Path,
) -> IdentityResult<TrustPool> {
    let mut pool = TrustPool::new();
    pool.add(identity.ca_der()?, "identity ca")?;

    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let pem = if entry.contains(PEM_HEADER) {
            entry.to_string()
        } else {
            let path = Path::new(entry);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                secrets_dir.join(path)
            };
            std::fs::read_to_string(&path)
                .map_err(|_| IdentityError::TrustEntryInvalid(entry.to_string()))?
        };

        let mut reader = std::io::Cursor::new(pem.as_bytes());
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let der = cert.map_err(|_| IdentityError::TrustEntryInvalid(entry.to_string()))?;
            pool.add(der, entry)?;
            added += 1;
        }
        if added == 0 {
            return Err(IdentityError::TrustEntryInvalid(entry.to_string()));
        }
    }

    debug!("trust pool holds {} anchors", pool.len());
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;

    fn test_identity(dir: &Path) -> Identity {
        IdentityStore::new(dir).load_or_create().unwrap()
    }

    fn other_ca_pem(dir: &Path) -> String {
        test_identity(dir).ca_pem().to_string()
    }

    #[test]
    fn test_pool_seeds_with_identity_ca() {
        let dir = tempfile::tempdir().unwrap();
        let identity = test_identity(dir.path());

        let pool = build_trust_pool(&identity, &[], dir.path()).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_inline_entry_grows_pool() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let identity = test_identity(dir.path());

        let inline = other_ca_pem(other.path());
        let pool = build_trust_pool(&identity, &[inline], dir.path()).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.subjects().len(), 2);
    }

    #[test]
    fn test_path_entry_resolves_against_secrets_dir() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let identity = test_identity(dir.path());

        std::fs::write(dir.path().join("peer.pem"), other_ca_pem(other.path())).unwrap();

        let pool = build_trust_pool(&identity, &["peer.pem".to_string()], dir.path()).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_duplicate_entry_keeps_pool_constant() {
        let dir = tempfile::tempdir().unwrap();
        let identity = test_identity(dir.path());

        // The identity CA fed back in as an inline entry is a duplicate.
        let dup = identity.ca_pem().to_string();
        let pool = build_trust_pool(&identity, &[dup.clone(), dup], dir.path()).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_invalid_entry_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let identity = test_identity(dir.path());

        let err = build_trust_pool(&identity, &["no-such-file.pem".to_string()], dir.path())
            .unwrap_err();
        assert!(matches!(err, IdentityError::TrustEntryInvalid(which) if which == "no-such-file.pem"));

        let err =
            build_trust_pool(&identity, &["-----BEGIN GARBAGE-----".to_string()], dir.path())
                .unwrap_err();
        assert!(matches!(err, IdentityError::TrustEntryInvalid(_)));
    }
}
