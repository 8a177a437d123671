//! GOConnect Identity Layer
//!
//! Owns the agent's long-lived cryptographic identity:
//! - A self-signed ECDSA P-256 signing CA (10 year validity)
//! - A host leaf certificate signed by that CA (1 year validity)
//! - The trust anchor pool used by both sides of the QUIC handshake
//!
//! Identity material is persisted under a secrets directory with owner-only
//! permissions on key files and reloaded verbatim on subsequent starts.

pub mod error;
pub mod identity;
pub mod trust;

pub use error::{IdentityError, IdentityResult};
pub use identity::{Identity, IdentityStore, TLS_SERVER_NAME};
pub use trust::{build_trust_pool, TrustPool};
