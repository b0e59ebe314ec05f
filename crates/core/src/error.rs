//! Error types for the Ember engine
//!
//! Layer-specific errors (codec, envelope, gateway, queue) live next to the
//! code that produces them and convert into [`Error`] when they cross into
//! the engine. We use `thiserror` for `Display` and `Error` impls.

use crate::cid::Cid;
use std::io;
use thiserror::Error;

/// Result type alias for Ember operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Ember engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file gateways, config files)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A block that must be present could not be fetched
    #[error("Missing block: {0}")]
    MissingBlock(Cid),

    /// `begin()` called while the pending overlay still holds blocks
    #[error("Transaction already in progress ({pending} pending blocks)")]
    TransactionInProgress {
        /// Number of uncommitted blocks in the overlay
        pending: usize,
    },

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Block codec failure (encryption, decryption, framing)
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Gateway or envelope failure at the storage boundary
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// Configuration could not be read or is invalid
    #[error("Config error: {0}")]
    ConfigError(String),
}

impl Error {
    /// True for errors that indicate corrupted or incomplete local state.
    ///
    /// These are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingBlock(_) | Error::TransactionInProgress { .. } | Error::Corruption(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::Codec;

    #[test]
    fn test_error_display_missing_block() {
        let cid = Cid::hash(Codec::Raw, b"gone");
        let err = Error::MissingBlock(cid);
        let msg = err.to_string();
        assert!(msg.contains("Missing block"));
        assert!(msg.contains(&cid.to_string()));
    }

    #[test]
    fn test_error_display_transaction_in_progress() {
        let err = Error::TransactionInProgress { pending: 3 };
        assert!(err.to_string().contains("3 pending"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::IoError(_)));
    }

    #[test]
    fn test_error_from_rmp_decode() {
        let result: std::result::Result<String, rmp_serde::decode::Error> =
            rmp_serde::from_slice(&[0xc1]);
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::SerializationError(_)));
    }

    #[test]
    fn test_fatal_classification() {
        let cid = Cid::hash(Codec::Raw, b"x");
        assert!(Error::MissingBlock(cid).is_fatal());
        assert!(Error::TransactionInProgress { pending: 1 }.is_fatal());
        assert!(!Error::GatewayError("timeout".into()).is_fatal());
    }
}
