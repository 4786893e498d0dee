//! Node identity and membership status

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Cluster-wide node identifier, `name@host:port`
///
/// Ordering is lexicographic on the full string. Duplicate-link resolution
/// and registry tie-breaks rely on every node agreeing on this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self(format!("{}@{}:{}", name, host, port))
    }

    /// Parse `name@host:port`
    pub fn parse(s: &str) -> Result<Self> {
        let (name, address) = s
            .split_once('@')
            .ok_or_else(|| TransportError::configuration(format!("Invalid node id '{}'", s), Some("node_id")))?;
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| TransportError::configuration(format!("Invalid node id '{}'", s), Some("node_id")))?;
        if name.is_empty() || host.is_empty() {
            return Err(TransportError::configuration(
                format!("Invalid node id '{}'", s),
                Some("node_id"),
            ));
        }
        port.parse::<u16>().map_err(|_| {
            TransportError::configuration(format!("Invalid port in node id '{}'", s), Some("node_id"))
        })?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.split_once('@').map(|(name, _)| name).unwrap_or(&self.0)
    }

    /// `host:port` part, used to dial the node
    pub fn address(&self) -> &str {
        self.0.split_once('@').map(|(_, addr)| addr).unwrap_or(&self.0)
    }

    pub fn host(&self) -> &str {
        self.address()
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or_else(|| self.address())
    }

    pub fn port(&self) -> u16 {
        self.address()
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a node as seen by the local membership table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl NodeStatus {
    fn rank(self) -> u8 {
        match self {
            NodeStatus::Starting => 0,
            NodeStatus::Running => 1,
            NodeStatus::Stopping => 2,
            NodeStatus::Stopped | NodeStatus::Crashed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Stopped | NodeStatus::Crashed)
    }
}

/// Membership record for one node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub status: NodeStatus,
    pub incarnation: u64,
    pub since: Instant,
}

impl NodeInfo {
    pub fn new(id: NodeId, incarnation: u64) -> Self {
        Self {
            id,
            status: NodeStatus::Starting,
            incarnation,
            since: Instant::now(),
        }
    }

    /// Move to `next` if it does not go backwards within this incarnation.
    ///
    /// Returns whether the status changed.
    pub fn transition(&mut self, next: NodeStatus) -> bool {
        if next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        self.since = Instant::now();
        true
    }

    pub fn is_running(&self) -> bool {
        self.status == NodeStatus::Running
    }
}
