//! Actor Error Types
//!
//! Every failure an actor-facing operation can report. Variants carry
//! rendered identifiers rather than the typed refs so the error stays
//! `Clone` and can cross the wire through [`crate::remote::RemoteFailure`].

use network::TransportError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ActorError {
    /// `init` returned an error, panicked or timed out
    #[error("Process init failed: {message}")]
    Init { message: String },

    #[error("Call to {process} timed out after {timeout_ms}ms")]
    CallTimeout { process: String, timeout_ms: u64 },

    #[error("Remote call to {process} on {node} timed out after {timeout_ms}ms")]
    RemoteCallTimeout {
        process: String,
        node: String,
        timeout_ms: u64,
    },

    /// The target node is not connected, or disconnected mid-request
    #[error("Node {node} is down")]
    NodeDown { node: String },

    #[error("Process {process} not found")]
    ProcessNotFound { process: String },

    /// The process stopped before it could answer
    #[error("Process {process} exited: {reason}")]
    ProcessExited { process: String, reason: String },

    #[error("Name '{name}' is already registered to {existing}")]
    GlobalNameConflict { name: String, existing: String },

    #[error("Name '{name}' is not registered")]
    NameNotFound { name: String },

    #[error("Supervisor {supervisor} not found")]
    SupervisorNotFound { supervisor: String },

    #[error("Child '{child}' not found")]
    ChildNotFound { child: String },

    #[error("Supervisor {supervisor} exceeded {max_restarts} restarts within {within_ms}ms")]
    MaxRestartsExceeded {
        supervisor: String,
        max_restarts: u32,
        within_ms: u64,
    },

    #[error("Behavior '{name}' is not registered on this node")]
    BehaviorNotFound { name: String },

    /// A typed operation named a behavior the process does not run
    #[error("Process {process} does not run behavior {expected}")]
    BehaviorMismatch { process: String, expected: String },

    /// Payload type tag or bincode body did not match
    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for actor operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    pub fn node_down(node: impl std::fmt::Display) -> Self {
        Self::NodeDown {
            node: node.to_string(),
        }
    }

    pub fn process_not_found(process: impl std::fmt::Display) -> Self {
        Self::ProcessNotFound {
            process: process.to_string(),
        }
    }

    pub fn process_exited(process: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::ProcessExited {
            process: process.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ActorError::CallTimeout { .. }
            | ActorError::RemoteCallTimeout { .. }
            | ActorError::NodeDown { .. } => true,
            ActorError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get error category for metrics and for the wire
    pub fn category(&self) -> &'static str {
        match self {
            ActorError::Init { .. } => "init",
            ActorError::CallTimeout { .. } => "call_timeout",
            ActorError::RemoteCallTimeout { .. } => "remote_call_timeout",
            ActorError::NodeDown { .. } => "node_down",
            ActorError::ProcessNotFound { .. } => "process_not_found",
            ActorError::ProcessExited { .. } => "process_exited",
            ActorError::GlobalNameConflict { .. } => "global_name_conflict",
            ActorError::NameNotFound { .. } => "name_not_found",
            ActorError::SupervisorNotFound { .. } => "supervisor_not_found",
            ActorError::ChildNotFound { .. } => "child_not_found",
            ActorError::MaxRestartsExceeded { .. } => "max_restarts_exceeded",
            ActorError::BehaviorNotFound { .. } => "behavior_not_found",
            ActorError::BehaviorMismatch { .. } => "behavior_mismatch",
            ActorError::Codec { .. } => "codec",
            ActorError::InvalidOperation { .. } => "invalid_operation",
            ActorError::Configuration { .. } => "configuration",
            ActorError::Transport(_) => "transport",
        }
    }
}

impl From<bincode::Error> for ActorError {
    fn from(err: bincode::Error) -> Self {
        ActorError::codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ActorError::node_down("a@127.0.0.1:1").is_retryable());
        assert!(ActorError::CallTimeout {
            process: "p".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!ActorError::process_not_found("p").is_retryable());
        assert!(!ActorError::codec("bad tag").is_retryable());
    }

    #[test]
    fn test_transport_errors_convert() {
        let err: ActorError = TransportError::not_connected("b@127.0.0.1:2").into();
        assert_eq!(err.category(), "transport");
        assert!(err.to_string().contains("b@127.0.0.1:2"));
    }

    #[test]
    fn test_display_names_the_subject() {
        let err = ActorError::GlobalNameConflict {
            name: "cache".into(),
            existing: "proc-1@n1".into(),
        };
        assert_eq!(err.to_string(), "Name 'cache' is already registered to proc-1@n1");
    }
}
