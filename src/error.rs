//! Error taxonomy for blob transfers.
//!
//! Not-found conditions are kept apart from opaque backend failures so callers
//! can decide whether a retry elsewhere makes sense.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Cloneable so a writer can hand its first part failure to every later
/// `close()` call.
#[derive(Error, Debug, Clone)]
pub enum BlobStoreError {
    #[error("Could not find {key}")]
    NotFound { key: String },

    /// Failure reported by the remote store that is not otherwise classified.
    #[error("Unknown blob store error: {message}")]
    Unknown { message: String },

    /// A single part fetch/upload failed in the middle of a transfer.
    #[error("Transfer of part {number} failed: {source}")]
    TransferFailure {
        number: u32,
        #[source]
        source: Box<BlobStoreError>,
    },

    #[error("Cannot finalize multipart upload: expected parts 0..{expected}, received {received}")]
    MissingParts { expected: usize, received: usize },

    #[error("Part {number} is out of range, parts must be below {limit}")]
    PartOutOfRange { number: u32, limit: u64 },

    #[error("Part {number} was submitted more than once")]
    DuplicatePart { number: u32 },

    /// An earlier part failed; the session stays open until the caller aborts it.
    #[error("Multipart upload {upload_id} has a failed part and will not be finalized")]
    UploadAborted { upload_id: String },

    #[error("Writer for {key} is already closed")]
    WriterClosed { key: String },

    #[error("The operation `{operation}` is unsupported by this backend")]
    Unsupported { operation: &'static str },

    #[error("Invalid blob store url: {url}")]
    InvalidUrl { url: String },

    #[error("IO error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("Transfer task failed to complete: {0}")]
    TaskJoin(#[source] Arc<tokio::task::JoinError>),
}

impl From<io::Error> for BlobStoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for BlobStoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskJoin(Arc::new(e))
    }
}

impl BlobStoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    pub(crate) fn transfer(number: u32, source: BlobStoreError) -> Self {
        Self::TransferFailure {
            number,
            source: Box::new(source),
        }
    }

    /// True when the object (or one of its parts) was absent, looking through
    /// a wrapping transfer failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::TransferFailure { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if repeating the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unknown { .. } | Self::Io(_) => true,
            // Panics repeat; cancellations need not.
            Self::TaskJoin(e) => e.is_cancelled(),
            Self::TransferFailure { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_seen_through_transfer_failure() {
        let err = BlobStoreError::transfer(3, BlobStoreError::not_found("a/b"));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Transfer of part 3 failed: Could not find a/b"
        );
    }

    #[test]
    fn test_unknown_is_retryable() {
        let err = BlobStoreError::transfer(0, BlobStoreError::unknown("SlowDown"));
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
        assert!(!BlobStoreError::MissingParts { expected: 2, received: 1 }.is_retryable());
        assert!(
            !BlobStoreError::PartOutOfRange {
                number: u32::MAX,
                limit: 10_000
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_clone_keeps_classification() {
        let err = BlobStoreError::transfer(
            1,
            io::Error::new(io::ErrorKind::ConnectionReset, "reset").into(),
        );
        let copy = err.clone();
        assert!(copy.is_retryable());
        assert_eq!(copy.to_string(), err.to_string());
        match copy {
            BlobStoreError::TransferFailure { number, source } => {
                assert_eq!(number, 1);
                assert!(matches!(
                    *source,
                    BlobStoreError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
