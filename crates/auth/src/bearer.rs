//! Shared-secret bearer tokens (print worker, admin tooling).

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Verifies a presented bearer token.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, presented: &str) -> Result<(), AuthError>;
}

/// Compares against a single configured token in constant time.
///
/// An empty or absent configured token rejects every request.
#[derive(Clone)]
pub struct StaticTokenVerifier {
    expected: Option<[u8; 32]>,
}

impl StaticTokenVerifier {
    pub fn new(expected: Option<&str>) -> Self {
        let expected = expected
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Sha256::digest(t.as_bytes()).into());
        Self { expected }
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }
}

impl std::fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenVerifier")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, presented: &str) -> Result<(), AuthError> {
        let expected = self.expected.as_ref().ok_or(AuthError::NotConfigured)?;
        if presented.is_empty() {
            return Err(AuthError::Missing);
        }
        // Digests have equal length, so the comparison time does not depend on
        // the presented token's length either.
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        if bool::from(expected.ct_eq(&presented)) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}
