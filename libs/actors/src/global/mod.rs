//! Global Name Registry
//!
//! Cluster-wide name to process bindings, replicated to every node and
//! eventually consistent. Each node keeps a full table and converges through
//! three channels:
//!
//! - incremental `Register`/`Unregister` broadcasts,
//! - a full snapshot sent to every peer that comes up,
//! - periodic snapshots as anti-entropy.
//!
//! Concurrent registrations of one name are settled by
//! [`RegistryEntry::precedence`], so every node keeps the same winner.
//! Entries whose origin node goes down, or whose process exits, are removed.

mod entry;

pub use entry::{RegistryEntry, RegistryEvent, RegistryMessage, UnregisterReason};

use crate::error::{ActorError, Result};
use crate::process::ProcessRef;
use crate::remote::{RemoteMessage, RemoteMessaging};
use entry::VersionClock;
use network::{EventBus, NodeId, Subscription};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct RegistryInner {
    messaging: RemoteMessaging,
    entries: Mutex<HashMap<String, RegistryEntry>>,
    /// Conflicts already reported here, keyed by name and losing process.
    /// Only locked while `entries` is held.
    resolved: Mutex<HashSet<(String, ProcessRef)>>,
    clock: VersionClock,
    events: EventBus<RegistryEvent>,
}

#[derive(Clone)]
pub struct GlobalRegistry {
    inner: Arc<RegistryInner>,
}

/// Side effects collected under the table lock, performed after it
#[derive(Default)]
struct Outcome {
    broadcasts: Vec<RegistryMessage>,
}

impl GlobalRegistry {
    pub fn new(messaging: RemoteMessaging) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                messaging,
                entries: Mutex::new(HashMap::new()),
                resolved: Mutex::new(HashSet::new()),
                clock: VersionClock::default(),
                events: EventBus::new(),
            }),
        }
    }

    fn local(&self) -> &NodeId {
        self.inner.messaging.local_node()
    }

    pub fn subscribe(&self) -> Subscription<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Bind `name` to `process` cluster-wide
    ///
    /// Fails with [`ActorError::GlobalNameConflict`] while the name is bound
    /// here, even to the same process.
    pub fn register(&self, name: &str, process: &ProcessRef) -> Result<RegistryEntry> {
        if process.is_on(self.local()) && !self.inner.messaging.runtime().is_alive(process) {
            return Err(ActorError::process_not_found(process));
        }

        let entry = {
            let mut entries = self.inner.entries.lock();
            if let Some(existing) = entries.get(name) {
                return Err(ActorError::GlobalNameConflict {
                    name: name.to_string(),
                    existing: existing.process.to_string(),
                });
            }
            let entry = RegistryEntry {
                name: name.to_string(),
                process: process.clone(),
                origin: self.local().clone(),
                version: self.inner.clock.next(),
            };
            entries.insert(name.to_string(), entry.clone());
            self.inner.events.publish(RegistryEvent::Registered(entry.clone()));
            entry
        };

        info!(name, process = %process, version = entry.version, "Registered global name");
        self.broadcast(RegistryMessage::Register(entry.clone()));
        Ok(entry)
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let entry = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.remove(name).ok_or_else(|| ActorError::NameNotFound {
                name: name.to_string(),
            })?;
            self.inner.events.publish(RegistryEvent::Unregistered {
                entry: entry.clone(),
                reason: UnregisterReason::Explicit,
            });
            entry
        };

        info!(name, process = %entry.process, "Unregistered global name");
        self.broadcast(RegistryMessage::Unregister {
            name: entry.name,
            process: entry.process,
        });
        Ok(())
    }

    pub fn whereis(&self, name: &str) -> Option<ProcessRef> {
        self.inner.entries.lock().get(name).map(|e| e.process.clone())
    }

    pub fn lookup(&self, name: &str) -> Result<ProcessRef> {
        self.whereis(name).ok_or_else(|| ActorError::NameNotFound {
            name: name.to_string(),
        })
    }

    pub fn entry(&self, name: &str) -> Option<RegistryEntry> {
        self.inner.entries.lock().get(name).cloned()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.inner.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.name).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    fn broadcast(&self, msg: RegistryMessage) {
        if let Err(e) = self.inner.messaging.broadcast_message(&RemoteMessage::Registry(msg)) {
            warn!(error = %e, "Failed to broadcast registry update");
        }
    }

    fn send_snapshot(&self, node: &NodeId) {
        // Enqueued under the table lock: a Register broadcast queued after
        // this snapshot always describes a newer table
        let table = self.inner.entries.lock();
        let mut entries: Vec<RegistryEntry> = table.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let count = entries.len();
        let msg = RemoteMessage::Registry(RegistryMessage::Snapshot { entries });
        let sent = self.inner.messaging.send_message(node, &msg);
        drop(table);
        match sent {
            Ok(()) => debug!(node = %node, entries = count, "Sent registry snapshot"),
            Err(e) => debug!(node = %node, error = %e, "Registry snapshot not sent"),
        }
    }

    /// Anti-entropy round: push the full table to every peer
    pub fn sync(&self) {
        let peers = self.inner.messaging.cluster().connected_nodes();
        for peer in &peers {
            self.send_snapshot(peer);
        }
    }

    pub fn on_node_up(&self, node: &NodeId) {
        self.send_snapshot(node);
    }

    /// Drop every binding that originated on `node` or points into it
    pub fn on_node_down(&self, node: &NodeId) {
        let mut entries = self.inner.entries.lock();
        let doomed: Vec<String> = entries
            .values()
            .filter(|e| &e.origin == node || &e.process.node == node)
            .map(|e| e.name.clone())
            .collect();
        for name in doomed {
            if let Some(entry) = entries.remove(&name) {
                self.inner.events.publish(RegistryEvent::Unregistered {
                    entry,
                    reason: UnregisterReason::NodeDown,
                });
            }
        }
    }

    /// A local process exited: release its names everywhere
    pub fn on_process_exit(&self, process: &ProcessRef) {
        let released: Vec<RegistryEntry> = {
            let mut entries = self.inner.entries.lock();
            let names: Vec<String> = entries
                .values()
                .filter(|e| &e.process == process)
                .map(|e| e.name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| entries.remove(&name))
                .inspect(|entry| {
                    self.inner.events.publish(RegistryEvent::Unregistered {
                        entry: entry.clone(),
                        reason: UnregisterReason::ProcessExited,
                    });
                })
                .collect()
        };

        for entry in released {
            debug!(name = %entry.name, process = %process, "Released name of exited process");
            self.broadcast(RegistryMessage::Unregister {
                name: entry.name,
                process: entry.process,
            });
        }
    }

    /// Whether remote information about `entry` can be trusted right now
    fn admissible(&self, entry: &RegistryEntry) -> bool {
        let local = self.local();
        let cluster = self.inner.messaging.cluster();
        // This node is the only authority on its own registrations
        if &entry.origin == local || !cluster.is_connected(&entry.origin) {
            return false;
        }
        if entry.process.is_on(local) {
            self.inner.messaging.runtime().is_alive(&entry.process)
        } else {
            cluster.is_connected(&entry.process.node)
        }
    }

    fn apply(
        &self,
        entries: &mut HashMap<String, RegistryEntry>,
        entry: RegistryEntry,
        outcome: &mut Outcome,
    ) {
        if !self.admissible(&entry) {
            return;
        }
        let Some(existing) = entries.get(&entry.name).cloned() else {
            entries.insert(entry.name.clone(), entry.clone());
            self.inner.events.publish(RegistryEvent::Registered(entry));
            return;
        };
        if existing == entry {
            return;
        }
        if existing.process == entry.process {
            if entry.wins_over(&existing) {
                entries.insert(entry.name.clone(), entry);
            }
            return;
        }

        let (winner, loser) = if entry.wins_over(&existing) {
            (entry, existing)
        } else {
            (existing, entry)
        };
        warn!(
            name = %winner.name,
            winner = %winner.process,
            loser = %loser.process,
            "Resolved global name conflict"
        );
        entries.insert(winner.name.clone(), winner.clone());
        self.report_conflict(&winner.name, &winner.process, &loser.process);
        if &loser.origin == self.local() {
            outcome.broadcasts.push(RegistryMessage::ConflictResolved {
                name: winner.name.clone(),
                winner,
                loser,
            });
        }
    }

    /// Publish `ConflictResolved` once per name and losing process
    fn report_conflict(&self, name: &str, winner: &ProcessRef, loser: &ProcessRef) {
        if !self
            .inner
            .resolved
            .lock()
            .insert((name.to_string(), loser.clone()))
        {
            return;
        }
        self.inner.events.publish(RegistryEvent::ConflictResolved {
            name: name.to_string(),
            winner: winner.clone(),
            loser: loser.clone(),
        });
    }

    /// Apply a registry message received from `from`
    pub fn handle_message(&self, from: &NodeId, msg: RegistryMessage) {
        let mut outcome = Outcome::default();
        {
            let mut entries = self.inner.entries.lock();
            match msg {
                RegistryMessage::Register(entry) => self.apply(&mut entries, entry, &mut outcome),
                RegistryMessage::Unregister { name, process } => {
                    let matches = entries.get(&name).is_some_and(|e| e.process == process);
                    if matches {
                        if let Some(entry) = entries.remove(&name) {
                            self.inner.events.publish(RegistryEvent::Unregistered {
                                entry,
                                reason: UnregisterReason::Explicit,
                            });
                        }
                    }
                }
                RegistryMessage::Snapshot { entries: snapshot } => {
                    let listed: HashSet<(&str, &ProcessRef)> = snapshot
                        .iter()
                        .filter(|e| &e.origin == from)
                        .map(|e| (e.name.as_str(), &e.process))
                        .collect();
                    let stale: Vec<String> = entries
                        .values()
                        .filter(|e| &e.origin == from)
                        .filter(|e| !listed.contains(&(e.name.as_str(), &e.process)))
                        .map(|e| e.name.clone())
                        .collect();
                    for name in stale {
                        if let Some(entry) = entries.remove(&name) {
                            self.inner.events.publish(RegistryEvent::Unregistered {
                                entry,
                                reason: UnregisterReason::Stale,
                            });
                        }
                    }

                    let count = snapshot.len();
                    for entry in snapshot {
                        self.apply(&mut entries, entry, &mut outcome);
                    }
                    self.inner.events.publish(RegistryEvent::Synced {
                        from: from.clone(),
                        entries: count,
                    });
                }
                RegistryMessage::ConflictResolved { name, winner, loser } => {
                    let held_loser = entries.get(&name).is_some_and(|e| e.process == loser.process);
                    if held_loser && self.admissible(&winner) {
                        entries.insert(name.clone(), winner.clone());
                    } else {
                        self.apply(&mut entries, winner.clone(), &mut outcome);
                    }
                    if entries.get(&name).is_some_and(|e| e.process == winner.process) {
                        self.report_conflict(&name, &winner.process, &loser.process);
                    }
                }
            }
        }

        for msg in outcome.broadcasts {
            self.broadcast(msg);
        }
    }
}
