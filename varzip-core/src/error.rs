//! Error types for varzip operations.
//!
//! This module provides the error type shared by the whole workspace. It
//! covers I/O failures, archive and per-column corruption, and misuse of the
//! open/close lifecycle.

use std::io;
use thiserror::Error;

/// The main error type for varzip operations.
#[derive(Debug, Error)]
pub enum VarzipError {
    /// I/O error from an underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A source file or archive could not be opened for the requested mode.
    #[error("Cannot open {path}: {message}")]
    OpenFailure {
        /// Path that failed to open.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// The archive structure itself is damaged (footer missing, part table
    /// inconsistent with the file contents).
    #[error("Corrupt archive: {message}")]
    CorruptArchive {
        /// Description of the corruption.
        message: String,
    },

    /// A decoded stream violates the invariants of its column
    /// (size sums mismatch, run-length sentinel misplaced, dictionary index
    /// out of range, truncated entropy-coded payload).
    #[error("Corrupt input: {message}")]
    CorruptInput {
        /// Description of the violation.
        message: String,
    },

    /// A stream id or name was not found where one is required.
    #[error("Stream not found: {name}")]
    StreamNotFound {
        /// Name of the missing stream.
        name: String,
    },

    /// A stream name was registered twice.
    #[error("Stream already registered: {name}")]
    DuplicateStream {
        /// The duplicated name.
        name: String,
    },

    /// A buffer or decoded payload could not be allocated.
    #[error("Out of memory: failed to reserve {needed} bytes")]
    OutOfMemory {
        /// Number of bytes requested.
        needed: usize,
    },

    /// A worker observed that the pipeline has already failed; surfaces as a
    /// no-op local abort.
    #[error("Operation cancelled")]
    Cancelled,

    /// An operation was invoked outside the open mode it requires.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the misuse.
        message: String,
    },
}

/// Result type alias for varzip operations.
pub type Result<T> = std::result::Result<T, VarzipError>;

impl VarzipError {
    /// Create an open-failure error.
    pub fn open_failure(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OpenFailure {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt-archive error.
    pub fn corrupt_archive(message: impl Into<String>) -> Self {
        Self::CorruptArchive {
            message: message.into(),
        }
    }

    /// Create a corrupt-input error.
    pub fn corrupt_input(message: impl Into<String>) -> Self {
        Self::CorruptInput {
            message: message.into(),
        }
    }

    /// Create a stream-not-found error.
    pub fn stream_not_found(name: impl Into<String>) -> Self {
        Self::StreamNotFound { name: name.into() }
    }

    /// Create a duplicate-stream error.
    pub fn duplicate_stream(name: impl Into<String>) -> Self {
        Self::DuplicateStream { name: name.into() }
    }

    /// Create an out-of-memory error.
    pub fn out_of_memory(needed: usize) -> Self {
        Self::OutOfMemory { needed }
    }

    /// Create a protocol-misuse error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VarzipError::corrupt_input("run-length sentinel inside a row");
        assert!(err.to_string().contains("sentinel"));

        let err = VarzipError::duplicate_stream("key_3_data");
        assert!(err.to_string().contains("key_3_data"));

        let err = VarzipError::open_failure("records.vz", "permission denied");
        assert!(err.to_string().contains("records.vz"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: VarzipError = io_err.into();
        assert!(matches!(err, VarzipError::Io(_)));
    }
}
