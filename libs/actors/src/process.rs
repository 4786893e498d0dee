//! Process identity
//!
//! A [`ProcessId`] is unique cluster-wide; a [`ProcessRef`] pairs it with the
//! node hosting the process, which is all a caller needs to reach it.

use network::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0.simple())
    }
}

/// Location-transparent handle to a process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessRef {
    pub id: ProcessId,
    pub node: NodeId,
}

impl ProcessRef {
    pub fn new(id: ProcessId, node: NodeId) -> Self {
        Self { id, node }
    }

    pub fn is_on(&self, node: &NodeId) -> bool {
        &self.node == node
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node)
    }
}

/// Lifecycle status of a local process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
}

/// Snapshot of a local process for introspection
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub process: ProcessRef,
    pub behavior: String,
    pub status: ProcessStatus,
    pub uptime: Duration,
    pub messages_handled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_ids_are_unique() {
        let a = ProcessId::new();
        let b = ProcessId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("proc-"));
    }

    #[test]
    fn test_process_ref_display_names_node() {
        let node = NodeId::new("alpha", "127.0.0.1", 4370);
        let pid = ProcessId::from_uuid(Uuid::nil());
        let pref = ProcessRef::new(pid, node.clone());
        assert!(pref.is_on(&node));
        assert_eq!(
            pref.to_string(),
            format!("proc-{}@{}", Uuid::nil().simple(), node)
        );
    }
}
