//! Network Infrastructure
//!
//! Transport and membership layer for the actor runtime: length-prefixed TCP
//! framing, the link wire protocol, the shared-secret handshake, cluster
//! membership with heartbeat failure detection, and the event bus the upper
//! layers subscribe through.

pub mod cluster;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transports;

// Re-export commonly used types
pub use cluster::{
    Cluster, ClusterConfig, ClusterEvent, DownReason, InboundFrame, NodeId, NodeInfo, NodeStatus,
};
pub use error::{Result, TransportError};
pub use events::{EventBus, Subscription};
pub use protocol::{Frame, SharedSecret, WireFormat};
pub use transports::TcpConfig;
