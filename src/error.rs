//! Error taxonomy shared by the codecs, the server and the client.
//!
//! Every failure is one [`Error`] variant, and every variant belongs to exactly
//! one [`ErrorClass`]. The class decides what happens next: the server turns a
//! per-request error into an `ERR` response and only drops the connection for
//! transport failures and protocol violations; the client surfaces everything.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transfer errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Truncated frame: expected {expected} bytes, received {received}")]
    TruncatedFrame { expected: usize, received: usize },

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u64, u64),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("Invalid exchange state: {0}")]
    InvalidState(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Request rejected by server: {0}")]
    Rejected(String),
}

/// Coarse classification used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    ProtocolViolation,
    IntegrityMismatch,
    Crypto,
    Storage,
    /// The peer answered with an `ERR` response
    Remote,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(_) | Error::PeerClosed | Error::TruncatedFrame { .. } => {
                ErrorClass::Transport
            }
            Error::FrameTooLarge(..)
            | Error::MalformedHeader(_)
            | Error::UnexpectedToken(_)
            | Error::InvalidState(_) => ErrorClass::ProtocolViolation,
            Error::InvalidFilename(_) | Error::Storage(_) => ErrorClass::Storage,
            Error::IntegrityMismatch { .. } => ErrorClass::IntegrityMismatch,
            Error::Crypto(_) => ErrorClass::Crypto,
            Error::Rejected(_) => ErrorClass::Remote,
        }
    }

    /// Whether the connection must be closed after this error.
    ///
    /// After a protocol violation the receiver can no longer tell where the
    /// next frame starts, so the stream is abandoned along with it.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transport | ErrorClass::ProtocolViolation
        )
    }

    pub(crate) fn storage(context: &str, err: io::Error) -> Self {
        Error::Storage(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(Error::PeerClosed.class(), ErrorClass::Transport);
        assert_eq!(
            Error::MalformedHeader("missing filename".into()).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            Error::InvalidFilename("../secret".into()).class(),
            ErrorClass::Storage
        );
        assert_eq!(Error::Crypto("bad block".into()).class(), ErrorClass::Crypto);
        assert_eq!(Error::Rejected("nope".into()).class(), ErrorClass::Remote);
    }

    #[test]
    fn test_connection_fatality() {
        assert!(Error::TruncatedFrame { expected: 4, received: 2 }.is_fatal_to_connection());
        assert!(Error::MalformedHeader("x".into()).is_fatal_to_connection());
        assert!(!Error::Storage("not found".into()).is_fatal_to_connection());
        assert!(!Error::IntegrityMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_fatal_to_connection());
    }
}
