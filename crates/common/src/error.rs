//! Common error types for ClusterLoop
//!
//! This module defines the error taxonomy shared by every node component.
//! Capability misses and admission denials are routing decisions, not errors,
//! and are deliberately absent here.

use thiserror::Error;

/// Main error type for ClusterLoop
#[derive(Error, Debug)]
pub enum ClusterLoopError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bus or inference engine call failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bounded operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed job body
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::time::error::Elapsed> for ClusterLoopError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ClusterLoopError::Timeout(err.to_string())
    }
}

impl ClusterLoopError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ClusterLoopError::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        ClusterLoopError::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ClusterLoopError::Timeout(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        ClusterLoopError::Decode(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ClusterLoopError::Internal(msg.into())
    }

    /// Whether this failure came from talking to the bus or the engine
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClusterLoopError::Transport(_) | ClusterLoopError::Timeout(_)
        )
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterLoopError::Config(_) => "config",
            ClusterLoopError::Transport(_) => "transport",
            ClusterLoopError::Timeout(_) => "timeout",
            ClusterLoopError::Decode(_) => "decode",
            ClusterLoopError::Serialization(_) => "serialization",
            ClusterLoopError::Io(_) => "io",
            ClusterLoopError::Internal(_) => "internal",
        }
    }
}

/// Result type alias for ClusterLoop operations
pub type Result<T> = std::result::Result<T, ClusterLoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ClusterLoopError::transport("engine down").is_transport());
        assert!(ClusterLoopError::timeout("publish").is_transport());
        assert!(!ClusterLoopError::decode("bad json").is_transport());
        assert!(!ClusterLoopError::config("missing file").is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_converts_to_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();

        let err: ClusterLoopError = elapsed.into();
        assert_eq!(err.kind(), "timeout");
    }
}
