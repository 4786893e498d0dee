//! Monitor bookkeeping
//!
//! Pure state: the table decides who must be told what, and
//! [`super::RemoteMessaging`] performs the deliveries. Every monitor fires
//! at most once because firing removes it.

use crate::messages::{ExitReason, MonitorId, ProcessDown};
use crate::process::{ProcessId, ProcessRef};
use network::NodeId;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// Who receives a [`ProcessDown`]
#[derive(Debug, Clone)]
pub enum Watcher {
    /// A local process, through `handle_info`
    Process(ProcessRef),
    /// A local channel
    Channel(mpsc::UnboundedSender<ProcessDown>),
    /// Another node that asked us to watch one of our processes
    Remote(NodeId),
}

impl Watcher {
    fn is_process(&self, process: &ProcessRef) -> bool {
        matches!(self, Watcher::Process(p) if p == process)
    }
}

#[derive(Debug)]
pub(crate) struct Delivery {
    pub watcher: Watcher,
    pub down: ProcessDown,
}

#[derive(Debug)]
struct Entry {
    target: ProcessRef,
    watcher: Watcher,
}

#[derive(Debug, Default)]
pub(crate) struct MonitorTable {
    /// Monitors on processes hosted here
    local: HashMap<MonitorId, Entry>,
    by_target: HashMap<ProcessId, HashSet<MonitorId>>,
    /// Monitors this node placed on processes hosted elsewhere
    outgoing: HashMap<MonitorId, Entry>,
}

impl MonitorTable {
    pub(crate) fn watch_local(&mut self, monitor: MonitorId, target: ProcessRef, watcher: Watcher) {
        self.by_target.entry(target.id).or_default().insert(monitor);
        self.local.insert(monitor, Entry { target, watcher });
    }

    pub(crate) fn watch_remote(&mut self, monitor: MonitorId, target: ProcessRef, watcher: Watcher) {
        self.outgoing.insert(monitor, Entry { target, watcher });
    }

    /// Drop a monitor. Returns the remote node to notify, if the target
    /// lived elsewhere, and whether anything was removed.
    pub(crate) fn remove(&mut self, monitor: &MonitorId) -> (bool, Option<NodeId>) {
        if let Some(entry) = self.local.remove(monitor) {
            self.unindex(&entry.target.id, monitor);
            return (true, None);
        }
        match self.outgoing.remove(monitor) {
            Some(entry) => (true, Some(entry.target.node)),
            None => (false, None),
        }
    }

    fn unindex(&mut self, target: &ProcessId, monitor: &MonitorId) {
        if let Some(monitors) = self.by_target.get_mut(target) {
            monitors.remove(monitor);
            if monitors.is_empty() {
                self.by_target.remove(target);
            }
        }
    }

    /// A local process exited. Fires its monitors and retires the ones it
    /// held itself; returns the deliveries plus the remote monitors to cancel.
    pub(crate) fn process_exited(
        &mut self,
        process: &ProcessRef,
        reason: &ExitReason,
    ) -> (Vec<Delivery>, Vec<(NodeId, MonitorId)>) {
        let mut deliveries = Vec::new();
        for monitor in self.by_target.remove(&process.id).unwrap_or_default() {
            if let Some(entry) = self.local.remove(&monitor) {
                deliveries.push(Delivery {
                    watcher: entry.watcher,
                    down: ProcessDown {
                        monitor,
                        process: process.clone(),
                        reason: reason.clone(),
                    },
                });
            }
        }

        let held_locally: Vec<MonitorId> = self
            .local
            .iter()
            .filter(|(_, entry)| entry.watcher.is_process(process))
            .map(|(id, _)| *id)
            .collect();
        for monitor in held_locally {
            if let Some(entry) = self.local.remove(&monitor) {
                self.unindex(&entry.target.id, &monitor);
            }
        }

        let held_remotely: Vec<MonitorId> = self
            .outgoing
            .iter()
            .filter(|(_, entry)| entry.watcher.is_process(process))
            .map(|(id, _)| *id)
            .collect();
        let mut cancels = Vec::new();
        for monitor in held_remotely {
            if let Some(entry) = self.outgoing.remove(&monitor) {
                cancels.push((entry.target.node, monitor));
            }
        }

        (deliveries, cancels)
    }

    /// The node hosting a remotely monitored process reported its exit
    pub(crate) fn remote_down(
        &mut self,
        monitor: MonitorId,
        process: ProcessRef,
        reason: ExitReason,
    ) -> Option<Delivery> {
        let entry = self.outgoing.remove(&monitor)?;
        Some(Delivery {
            watcher: entry.watcher,
            down: ProcessDown {
                monitor,
                process,
                reason,
            },
        })
    }

    /// Fire every monitor on processes of `node` and forget the ones `node`
    /// held on us
    pub(crate) fn node_down(&mut self, node: &NodeId) -> Vec<Delivery> {
        let fired: Vec<MonitorId> = self
            .outgoing
            .iter()
            .filter(|(_, entry)| &entry.target.node == node)
            .map(|(id, _)| *id)
            .collect();
        let mut deliveries = Vec::with_capacity(fired.len());
        for monitor in fired {
            if let Some(entry) = self.outgoing.remove(&monitor) {
                deliveries.push(Delivery {
                    watcher: entry.watcher,
                    down: ProcessDown {
                        monitor,
                        process: entry.target,
                        reason: ExitReason::NodeDown(node.clone()),
                    },
                });
            }
        }

        let orphaned: Vec<MonitorId> = self
            .local
            .iter()
            .filter(|(_, entry)| matches!(&entry.watcher, Watcher::Remote(n) if n == node))
            .map(|(id, _)| *id)
            .collect();
        for monitor in orphaned {
            if let Some(entry) = self.local.remove(&monitor) {
                self.unindex(&entry.target.id, &monitor);
            }
        }

        deliveries
    }

    pub(crate) fn len(&self) -> usize {
        self.local.len() + self.outgoing.len()
    }
}
