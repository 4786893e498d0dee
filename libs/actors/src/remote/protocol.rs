//! Node-to-node actor protocol
//!
//! Every [`RemoteMessage`] travels bincode-encoded inside a single data frame
//! of the link between two nodes, so messages between a pair of nodes keep
//! their send order.

use crate::error::ActorError;
use crate::global::RegistryMessage;
use crate::messages::{ExitReason, MonitorId, Payload};
use crate::process::{ProcessId, ProcessRef};
use network::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteMessage {
    CallRequest {
        call_id: u64,
        target: ProcessId,
        payload: Payload,
        timeout_ms: u64,
    },
    Cast {
        target: ProcessId,
        payload: Payload,
    },
    SpawnRequest {
        call_id: u64,
        behavior: String,
        args: Payload,
        timeout_ms: u64,
    },
    StopRequest {
        call_id: u64,
        target: ProcessId,
        reason: ExitReason,
        timeout_ms: u64,
    },
    /// Watch `target` on the receiving node; it answers with `ProcessDown`
    MonitorRequest {
        monitor: MonitorId,
        target: ProcessId,
    },
    Demonitor {
        monitor: MonitorId,
    },
    ProcessDown {
        monitor: MonitorId,
        process: ProcessRef,
        reason: ExitReason,
    },
    Reply {
        call_id: u64,
        result: Result<ReplyBody, RemoteFailure>,
    },
    Registry(RegistryMessage),
}

impl RemoteMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteMessage::CallRequest { .. } => "call_request",
            RemoteMessage::Cast { .. } => "cast",
            RemoteMessage::SpawnRequest { .. } => "spawn_request",
            RemoteMessage::StopRequest { .. } => "stop_request",
            RemoteMessage::MonitorRequest { .. } => "monitor_request",
            RemoteMessage::Demonitor { .. } => "demonitor",
            RemoteMessage::ProcessDown { .. } => "process_down",
            RemoteMessage::Reply { .. } => "reply",
            RemoteMessage::Registry(_) => "registry",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ActorError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ActorError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    Payload(Payload),
    Spawned(ProcessRef),
    Stopped,
}

/// An [`ActorError`] flattened for the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: String,
    pub detail: String,
}

impl From<&ActorError> for RemoteFailure {
    fn from(err: &ActorError) -> Self {
        let detail = match err {
            ActorError::Init { message }
            | ActorError::Codec { message }
            | ActorError::InvalidOperation { message }
            | ActorError::Configuration { message } => message.clone(),
            ActorError::CallTimeout { process, .. }
            | ActorError::RemoteCallTimeout { process, .. }
            | ActorError::ProcessNotFound { process }
            | ActorError::BehaviorMismatch { process, .. } => process.clone(),
            ActorError::ProcessExited { process, reason } => format!("{}|{}", process, reason),
            ActorError::NodeDown { node } => node.clone(),
            ActorError::NameNotFound { name } | ActorError::BehaviorNotFound { name } => name.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.category().to_string(),
            detail,
        }
    }
}

impl RemoteFailure {
    /// Rebuild the error on the caller's side of a request to `node`
    pub fn into_error(self, node: &NodeId, timeout_ms: u64) -> ActorError {
        let RemoteFailure { kind, detail } = self;
        match kind.as_str() {
            "init" => ActorError::Init { message: detail },
            "codec" => ActorError::Codec { message: detail },
            "call_timeout" | "remote_call_timeout" => ActorError::RemoteCallTimeout {
                process: detail,
                node: node.to_string(),
                timeout_ms,
            },
            "process_not_found" => ActorError::ProcessNotFound { process: detail },
            "process_exited" => {
                let (process, reason) = detail
                    .split_once('|')
                    .map(|(p, r)| (p.to_string(), r.to_string()))
                    .unwrap_or((detail.clone(), String::new()));
                ActorError::ProcessExited { process, reason }
            }
            "node_down" => ActorError::NodeDown { node: detail },
            "behavior_not_found" => ActorError::BehaviorNotFound { name: detail },
            "behavior_mismatch" => ActorError::BehaviorMismatch {
                process: detail,
                expected: String::new(),
            },
            "name_not_found" => ActorError::NameNotFound { name: detail },
            _ => ActorError::InvalidOperation {
                message: format!("{} on {}: {}", kind, node, detail),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::new("b", "127.0.0.1", 4370)
    }

    #[test]
    fn test_failures_keep_their_kind_across_the_wire() {
        let cases = vec![
            ActorError::process_not_found("proc-1@b"),
            ActorError::init("boom"),
            ActorError::BehaviorNotFound { name: "worker".into() },
            ActorError::process_exited("proc-2@b", "error: bad"),
        ];
        for err in cases {
            let failure = RemoteFailure::from(&err);
            let rebuilt = failure.into_error(&node(), 100);
            assert_eq!(rebuilt.category(), err.category());
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_remote_side_timeout_becomes_remote_call_timeout() {
        let err = ActorError::CallTimeout {
            process: "proc-1@b".into(),
            timeout_ms: 50,
        };
        let rebuilt = RemoteFailure::from(&err).into_error(&node(), 50);
        assert!(matches!(rebuilt, ActorError::RemoteCallTimeout { ref node, .. } if node.starts_with("b@")));
    }

    #[test]
    fn test_message_survives_encoding() {
        let msg = RemoteMessage::Reply {
            call_id: 9,
            result: Err(RemoteFailure {
                kind: "codec".into(),
                detail: "bad".into(),
            }),
        };
        let decoded = RemoteMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "reply");
        assert!(RemoteMessage::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
