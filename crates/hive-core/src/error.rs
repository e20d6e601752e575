//! Error types for hive operations.
//!
//! This module defines [`HiveError`], the error enum shared by every hive
//! crate. Errors carry enough context to be actionable (which operation,
//! which worker, which listen key) and chain their OS-level sources.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Role, WorkerId};

/// Result type alias using [`HiveError`].
pub type Result<T> = std::result::Result<T, HiveError>;

/// Error type for all hive operations.
#[derive(Debug, Error)]
pub enum HiveError {
    // =========================================================================
    // Settings Errors
    // =========================================================================
    /// The path of the program to fork could not be determined
    #[error("Cannot resolve worker executable: {message}")]
    ExecResolve { message: String },

    /// A required environment variable held a value we cannot use
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Channel Errors
    // =========================================================================
    /// The IPC channel to the peer is closed; terminal for that peer
    #[error("IPC channel closed")]
    ChannelClosed,

    /// A channel read or write failed at the socket level
    #[error("IPC channel {operation} failed")]
    ChannelIo {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// An inbound frame violated the wire format
    #[error("Malformed frame: {message}")]
    Frame { message: String },

    /// A message body failed to (de)serialize
    #[error("Codec error in {context}")]
    Codec {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A message that must carry an OS handle arrived without one
    #[error("Message {cmd:?} arrived without its handle")]
    HandleMissing { cmd: String },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// Operation requires the other role
    #[error("Operation {operation} is not available in the {role} role")]
    RoleMismatch {
        operation: &'static str,
        role: Role,
    },

    /// Worker not found in the supervisor's map
    #[error("Worker not found: {id}")]
    WorkerNotFound { id: WorkerId },

    /// Spawning the worker process failed
    #[error("Failed to spawn worker {id} ({exec})")]
    Spawn {
        id: WorkerId,
        exec: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A pending query was abandoned because the peer went away
    #[error("Query {token} dropped: peer disconnected before replying")]
    QueryDropped { token: String },

    // =========================================================================
    // Listener Errors
    // =========================================================================
    /// The master failed to bind the shared listener
    #[error("Failed to bind shared listener for {key}: {message}")]
    Bind { key: String, message: String },

    /// The listen arguments could not be turned into a socket address
    #[error("Cannot resolve listen address {spec}")]
    ListenAddress { spec: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in hive)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HiveError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create an I/O error with an operation description.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a channel-level I/O error.
    pub fn channel(operation: &'static str, source: std::io::Error) -> Self {
        Self::ChannelIo { operation, source }
    }

    /// Create a malformed-frame error.
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(context: &'static str, source: serde_json::Error) -> Self {
        Self::Codec { context, source }
    }

    /// Create a bind error for a listen fingerprint.
    pub fn bind(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bind {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if this error means the peer's channel is gone.
    ///
    /// Channel loss is terminal for that worker: the supervisor reacts with
    /// `prepare_exit`, never with a retry.
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            Self::ChannelClosed | Self::ChannelIo { .. } | Self::QueryDropped { .. }
        )
    }

    /// Returns true if this error indicates a programmer mistake rather than
    /// a runtime condition.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::RoleMismatch { .. } | Self::Internal { .. })
    }

    /// Returns true if the error concerns the shared-listener machinery.
    pub fn is_listener_error(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::ListenAddress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_classification() {
        assert!(HiveError::ChannelClosed.is_channel_error());
        assert!(HiveError::channel("recv", std::io::Error::other("boom")).is_channel_error());
        assert!(!HiveError::bind("127.0.0.1:80", "in use").is_channel_error());
    }

    #[test]
    fn test_bind_error_display() {
        let err = HiveError::bind("127.0.0.1:8080", "address in use");
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert!(err.is_listener_error());
    }

    #[test]
    fn test_role_mismatch_display() {
        let err = HiveError::RoleMismatch {
            operation: "fork",
            role: Role::Worker,
        };
        assert!(err.to_string().contains("fork"));
        assert!(err.to_string().contains("worker"));
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_spawn_error_source() {
        use std::error::Error as _;
        let err = HiveError::Spawn {
            id: 3,
            exec: "/bin/does-not-exist".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains('3'));
        assert!(err.source().is_some());
    }
}
