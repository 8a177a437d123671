//! Identity layer errors

use std::path::PathBuf;

use thiserror::Error;

/// Identity layer errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Secrets directory cannot be created or written
    #[error("secrets unavailable at {path}: {source}")]
    SecretsUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),

    /// Persisted certificate or key could not be parsed
    #[error("certificate parse error: {0}")]
    CertificateParse(String),

    /// A configured trust entry could not be loaded
    #[error("invalid trust entry '{0}'")]
    TrustEntryInvalid(String),
}

/// Result type for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;
