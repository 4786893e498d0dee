//! Link Frames
//!
//! Wire protocol for peer links. Every TCP frame carries exactly one
//! bincode-encoded [`Frame`].

use crate::cluster::NodeId;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Wire format constants
pub struct WireFormat;

impl WireFormat {
    /// Protocol version, checked during the handshake
    pub const VERSION: u16 = 1;
}

/// One unit of link traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every new link, sent by the connecting side
    Hello {
        node: NodeId,
        incarnation: u64,
        protocol_version: u16,
        secret_digest: [u8; 32],
    },
    /// Handshake accepted; the digest lets the connector check the acceptor
    Welcome {
        node: NodeId,
        incarnation: u64,
        secret_digest: [u8; 32],
    },
    /// Handshake refused; the connection is closed afterwards
    Reject { reason: String },
    Heartbeat { sequence: u64 },
    /// Sender's currently connected peers
    Gossip { peers: Vec<NodeId> },
    /// Graceful departure
    Goodbye { reason: String },
    /// Opaque payload for the layers above membership
    Data(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Reject { .. } => "reject",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::Gossip { .. } => "gossip",
            Frame::Goodbye { .. } => "goodbye",
            Frame::Data(_) => "data",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
