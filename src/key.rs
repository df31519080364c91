//! Signature hashing.
//!
//! Callers identify a desired artifact by an opaque signature string; two
//! equal signatures request the identical artifact (that equivalence is
//! the caller's contract). All filesystem paths are keyed by the SHA-256
//! of the signature, so signatures of any length, including empty, map to
//! fixed-width names.

use std::fmt;

use sha2::{Digest, Sha256};

/// Fixed-width cache key derived from a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash a signature into a key.
    pub fn from_signature(signature: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(signature.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used to fan entries out across directories.
    pub fn fanout_prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let key = CacheKey::from_signature("hello");
        assert_eq!(
            key.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(key.fanout_prefix(), "2c");
    }

    #[test]
    fn test_empty_signature_is_legal() {
        let key = CacheKey::from_signature("");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_long_signature_stays_fixed_width() {
        let signature = "x".repeat(1 << 16);
        let key = CacheKey::from_signature(&signature);
        assert_eq!(key.as_str().len(), 64);
    }

    #[test]
    fn test_distinct_signatures_distinct_keys() {
        assert_ne!(
            CacheKey::from_signature("sig-A"),
            CacheKey::from_signature("sig-B")
        );
    }

    #[test]
    fn test_equal_signatures_equal_keys() {
        assert_eq!(
            CacheKey::from_signature("sig-A"),
            CacheKey::from_signature("sig-A")
        );
    }
}
