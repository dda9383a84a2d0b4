//! Content digests and the policy applied when they disagree.
//!
//! The digest is MD5 rendered as 32 lowercase hex characters. It detects
//! transmission corruption; it is not an authenticity check.
//!
//! ## Mismatch policy
//!
//! The two sides deliberately treat a mismatch differently:
//!
//! - The server defaults to [`IntegrityPolicy::Warn`]: the upload is stored and
//!   the mismatch is logged. The digest it computed goes back in the PUT
//!   acknowledgement, so the client still learns about it.
//! - The client always uses [`IntegrityPolicy::Reject`]: a downloaded file is
//!   saved only when its digest matches, and a PUT whose acknowledgement
//!   carries a different digest fails.

use clap::ValueEnum;
use md5::{Digest, Md5};
use tracing::warn;

use crate::error::{Error, Result};

/// Length of a rendered digest
pub const DIGEST_HEX_LEN: usize = 32;

/// Which bytes of a transfer the digest covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DigestScope {
    /// The file content before encryption
    #[default]
    Plaintext,
    /// The encrypted body as transmitted
    Ciphertext,
}

impl DigestScope {
    /// Pick the bytes this scope covers
    pub fn select<'a>(self, plaintext: &'a [u8], ciphertext: &'a [u8]) -> &'a [u8] {
        match self {
            DigestScope::Plaintext => plaintext,
            DigestScope::Ciphertext => ciphertext,
        }
    }
}

/// What to do when a received digest does not match the content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Log the mismatch and accept the content
    Warn,
    /// Fail the exchange
    Reject,
}

impl IntegrityPolicy {
    /// Check `content` against the `expected` digest under this policy
    pub fn enforce(self, context: &str, expected: &str, content: &[u8]) -> Result<()> {
        if verify(expected, content) {
            return Ok(());
        }

        let actual_hex = digest(content);
        match self {
            IntegrityPolicy::Warn => {
                warn!(
                    "⚠️  {}: digest mismatch (expected {}, got {}), accepting",
                    context, expected, actual_hex
                );
                Ok(())
            }
            IntegrityPolicy::Reject => Err(Error::IntegrityMismatch {
                expected: expected.to_string(),
                actual: actual_hex,
            }),
        }
    }
}

/// Calculate the MD5 digest of data
pub fn digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Recompute the digest of `actual` and compare it case-sensitively
pub fn verify(expected_hex: &str, actual: &[u8]) -> bool {
    digest(actual) == expected_hex
}

/// Whether `s` has the shape of a rendered digest
pub fn is_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(digest(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            digest(b"The quick brown fox jumps over the lazy dog"),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[test]
    fn test_verify_is_case_sensitive() {
        assert!(verify("d41d8cd98f00b204e9800998ecf8427e", b""));
        assert!(!verify("D41D8CD98F00B204E9800998ECF8427E", b""));
        assert!(!verify("d41d8cd98f00b204e9800998ecf8427e", b"x"));
    }

    #[test]
    fn test_is_digest() {
        assert!(is_digest(&digest(b"abc")));
        assert!(!is_digest("abc"));
        assert!(!is_digest("D41D8CD98F00B204E9800998ECF8427E"));
        assert!(!is_digest("g41d8cd98f00b204e9800998ecf8427e"));
    }

    #[test]
    fn test_policy() {
        let good = digest(b"payload");
        assert!(IntegrityPolicy::Warn.enforce("test", &good, b"other").is_ok());
        assert!(IntegrityPolicy::Reject.enforce("test", &good, b"payload").is_ok());
        match IntegrityPolicy::Reject.enforce("test", &good, b"other") {
            Err(Error::IntegrityMismatch { expected, actual }) => {
                assert_eq!(expected, good);
                assert_eq!(actual, digest(b"other"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_scope_selects_bytes() {
        assert_eq!(DigestScope::Plaintext.select(b"p", b"c"), b"p");
        assert_eq!(DigestScope::Ciphertext.select(b"p", b"c"), b"c");
    }
}
