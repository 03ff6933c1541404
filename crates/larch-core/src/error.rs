//! Shared error taxonomy for blob and schema operations.
//!
//! Leaf operations return these values directly; composite backends retry
//! across siblings only on `NotFound`/`Transient` reads. The HTTP boundary
//! maps `NotFound` to 404 and `Malformed`/`MismatchedDigest` to 400.

use thiserror::Error;

/// Error taxonomy shared across the workspace.
#[derive(Debug, Error)]
pub enum Error {
    /// Blob absent, directory entry absent, or schema resolution failed.
    #[error("blob not found")]
    NotFound,

    /// Unparseable reference, invalid schema blob, or contract violation
    /// in caller-supplied data.
    #[error("malformed input: {reason}")]
    Malformed {
        /// What was wrong with the input.
        reason: String,
    },

    /// Receive hashed different bytes than the announced reference.
    #[error("mismatched digest: expected {expected}, computed {computed}")]
    MismatchedDigest {
        /// The reference the sender announced.
        expected: String,
        /// The reference computed from the received bytes.
        computed: String,
    },

    /// A file schema's declared size disagrees with its content parts.
    #[error("declared file size disagrees with sum of content parts")]
    SizeMismatch,

    /// Operation on a reader or writer after close.
    #[error("operation on closed reader")]
    Closed,

    /// The backend does not support this capability.
    #[error("operation not supported by this storage: {operation}")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// I/O failure or remote unreachable; callers may retry.
    #[error("transient storage error: {source}")]
    Transient {
        #[from]
        source: std::io::Error,
    },

    /// Fatal configuration problem, only surfaced at startup.
    #[error("configuration error: {reason}")]
    Config {
        /// What was wrong with the configuration.
        reason: String,
    },
}

impl Error {
    /// Malformed-input error from any displayable reason.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::Malformed { reason: reason.into() }
    }

    /// Configuration error from any displayable reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config { reason: reason.into() }
    }

    /// Transient error from a plain message (remote failures without an
    /// underlying `io::Error`).
    pub fn transient(reason: impl Into<String>) -> Self {
        Error::Transient {
            source: std::io::Error::other(reason.into()),
        }
    }

    /// Whether a read may be retried against a sibling backend.
    pub fn is_retriable_read(&self) -> bool {
        matches!(self, Error::NotFound | Error::Transient { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Malformed {
            reason: format!("invalid JSON: {err}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
