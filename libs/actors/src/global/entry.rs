//! Registry entries and the messages that replicate them

use crate::process::ProcessRef;
use network::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One name binding, as replicated to every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub process: ProcessRef,
    /// Node that performed the registration
    pub origin: NodeId,
    /// Registration time on `origin`, milliseconds, strictly increasing per node
    pub version: u64,
}

impl RegistryEntry {
    /// Total order used to settle conflicts: earlier version, then lower
    /// process id, then lower origin. Every node computes the same winner.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.process.id.cmp(&other.process.id))
            .then_with(|| self.origin.cmp(&other.origin))
    }

    pub fn wins_over(&self, other: &Self) -> bool {
        self.precedence(other) == Ordering::Less
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryMessage {
    Register(RegistryEntry),
    Unregister { name: String, process: ProcessRef },
    /// Full table of the sender. Authoritative for entries it originated,
    /// advisory for the rest.
    Snapshot { entries: Vec<RegistryEntry> },
    ConflictResolved {
        name: String,
        winner: RegistryEntry,
        loser: RegistryEntry,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterReason {
    Explicit,
    ProcessExited,
    NodeDown,
    /// Missing from its origin's snapshot
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(RegistryEntry),
    Unregistered {
        entry: RegistryEntry,
        reason: UnregisterReason,
    },
    ConflictResolved {
        name: String,
        winner: ProcessRef,
        loser: ProcessRef,
    },
    Synced {
        from: NodeId,
        entries: usize,
    },
}

/// Wall-clock milliseconds, bumped so no two versions from one node repeat
#[derive(Debug, Default)]
pub(crate) struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub(crate) fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let previous = self
            .last
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}
