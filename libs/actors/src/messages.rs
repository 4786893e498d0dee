//! Message Types
//!
//! Anything serde can round-trip is a [`Message`]. Locally messages move by
//! value through the mailbox; they only become a [`Payload`] when they cross
//! a node boundary.

use crate::error::{ActorError, Result};
use crate::process::ProcessRef;
use network::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Marker for types that can be sent to a process
pub trait Message: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// A bincode-encoded message tagged with its Rust type name
///
/// Decoding checks the tag first, so a payload sent to a process running a
/// different behavior fails with a codec error instead of misparsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            type_name: std::any::type_name::<T>().to_string(),
            data: bincode::serialize(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let expected = std::any::type_name::<T>();
        if self.type_name != expected {
            return Err(ActorError::codec(format!(
                "payload carries {}, expected {}",
                self.type_name, expected
            )));
        }
        Ok(bincode::deserialize(&self.data)?)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Why a process stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Normal,
    Shutdown,
    /// Stopped without running `terminate`
    Killed,
    /// A handler returned an error or panicked
    Error(String),
    /// The node hosting the process became unreachable
    NodeDown(NodeId),
    /// The process did not exist when it was monitored
    NoProc,
}

impl ExitReason {
    /// Normal and shutdown exits are not failures
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal | ExitReason::Shutdown)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Shutdown => f.write_str("shutdown"),
            ExitReason::Killed => f.write_str("killed"),
            ExitReason::Error(message) => write!(f, "error: {}", message),
            ExitReason::NodeDown(node) => write!(f, "node_down: {}", node),
            ExitReason::NoProc => f.write_str("noproc"),
        }
    }
}

/// Identifies one monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(Uuid);

impl MonitorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MonitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mon-{}", self.0.simple())
    }
}

/// Delivered once to every watcher of a process that stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDown {
    pub monitor: MonitorId,
    pub process: ProcessRef,
    pub reason: ExitReason,
}

/// Runtime notifications delivered to `handle_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    ProcessDown(ProcessDown),
}
