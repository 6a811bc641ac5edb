//! Error types for replication operations.

use thiserror::Error;

use crate::message::ConfirmationCode;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid block size specified.
    #[error("Invalid block size: {0} (must be non-zero)")]
    InvalidBlockSize(u64),

    /// A relative path escaped the configured root after normalization.
    #[error("Path escapes root: {0}")]
    PathEscape(String),

    /// Protocol violation on the wire (bad magic, version, frame, payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An RPC did not complete within its deadline.
    #[error("Deadline of {seconds}s exceeded for {operation}")]
    Deadline {
        /// Name of the RPC that timed out.
        operation: &'static str,
        /// Configured deadline in seconds.
        seconds: u64,
    },

    /// The peer answered, but with a non-success confirmation code.
    #[error("Remote rejected {operation}: {code:?}")]
    Remote {
        /// Name of the rejected RPC.
        operation: &'static str,
        /// Code returned by the receiver.
        code: ConfirmationCode,
    },

    /// Filesystem watcher failure.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ReplicaError::Io(io_err);
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_display_invalid_block_size() {
        let err = ReplicaError::InvalidBlockSize(0);
        assert!(err.to_string().contains("Invalid block size: 0"));
    }

    #[test]
    fn error_display_path_escape() {
        let err = ReplicaError::PathEscape("../../etc/passwd".to_string());
        assert!(err.to_string().contains("escapes root"));
    }

    #[test]
    fn error_display_deadline() {
        let err = ReplicaError::Deadline {
            operation: "Replicate",
            seconds: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("10s"));
        assert!(msg.contains("Replicate"));
    }

    #[test]
    fn error_display_remote() {
        let err = ReplicaError::Remote {
            operation: "Rename",
            code: ConfirmationCode::UpdateError,
        };
        assert!(err.to_string().contains("Rename"));
    }

    #[test]
    fn result_type_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.unwrap_or(0), 42);
    }
}
