//! Error types for the busrpc system.

use thiserror::Error;

/// Top-level error type returned by the public busrpc API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// A method was declared under one of the reserved verbs.
    #[error("Method name \"{0}\" is not allowed")]
    ReservedMethod(String),

    /// The addressed process is not in the node registry.
    #[error("Cannot {verb} {target} - process with id {pid} not found")]
    NodeNotFound {
        /// The operation that was attempted (`call`, `emit` or `send`).
        verb: &'static str,
        /// Method or event name the operation targeted.
        target: String,
        /// The unknown process id.
        pid: String,
    },

    /// The remote handler failed. Displays the remote message verbatim.
    #[error("{0}")]
    Remote(String),

    /// No response arrived within the configured call timeout.
    #[error("IPC request timeout. Process: {pid}, method: {method}")]
    Timeout {
        /// The local process id.
        pid: String,
        /// The method that was called.
        method: String,
    },

    /// The node's shortcut table has no entry for this method.
    #[error("No shortcut for method \"{0}\"")]
    NoShortcut(String),

    /// `connect` was called on an instance that is already connected.
    #[error("Already connected")]
    AlreadyConnected,

    /// The instance is not connected to the broker.
    #[error("Not connected")]
    NotConnected,

    /// The broker connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RpcError {
    /// Whether the outcome of the remote operation is unknown.
    ///
    /// A timed out call may still have run on the remote side.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}

/// Alias for Result with RpcError.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_verbatim() {
        let err = RpcError::Remote("test".to_string());
        assert_eq!(err.to_string(), "test");
    }

    #[test]
    fn test_node_not_found_message() {
        let err = RpcError::NodeNotFound {
            verb: "call",
            target: "sum".to_string(),
            pid: "p3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot call sum - process with id p3 not found"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = RpcError::Timeout {
            pid: "p1".to_string(),
            method: "wait".to_string(),
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "IPC request timeout. Process: p1, method: wait"
        );
    }

    #[test]
    fn test_reserved_method_message() {
        let err = RpcError::ReservedMethod("send".to_string());
        assert_eq!(err.to_string(), "Method name \"send\" is not allowed");
        assert!(!err.is_timeout());
    }
}
