// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redaction helpers for log fields.
//!
//! Cache keys can embed caller-controlled data (device ids, query parameters),
//! so they are never written to logs verbatim. Log the digest instead.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const DIGEST_PREFIX_LEN: usize = 12;

/// Hashed prefix of a key, safe to put in a log field.
#[must_use]
pub fn key_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(DIGEST_PREFIX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_short() {
        let a = key_digest("plug:device:42");
        let b = key_digest("plug:device:42");
        assert_eq!(a, b);
        assert_eq!(a.len(), DIGEST_PREFIX_LEN);
        assert!(!a.contains("device"));
    }

    #[test]
    fn test_digest_differs_per_key() {
        assert_ne!(key_digest("a"), key_digest("b"));
    }
}
