//! Remote Messaging
//!
//! Location-transparent call, cast, spawn, stop and monitor. A target on
//! this node short-circuits to the [`ActorRuntime`]; anything else becomes
//! a [`RemoteMessage`] on the link to the hosting node.
//!
//! Requests to one node are answered in the order the target processes
//! handle them, because inbound requests are enqueued into mailboxes in
//! arrival order before any reply is awaited.

pub mod monitor;
mod pending;
pub mod protocol;

pub use monitor::Watcher;
pub use protocol::{RemoteFailure, RemoteMessage, ReplyBody};

use crate::behaviors::{Behavior, BehaviorRegistry};
use crate::error::{ActorError, Result};
use crate::messages::{ExitReason, MonitorId, Payload, ProcessDown, SystemMessage};
use crate::process::ProcessRef;
use crate::system::{ActorRuntime, SpawnOptions};
use monitor::{Delivery, MonitorTable};
use network::{Cluster, NodeId};
use parking_lot::Mutex;
use pending::PendingCalls;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Extra wait on top of a remote operation's own deadline, so the remote
/// side's verdict arrives before the local timer fires
const REPLY_MARGIN: Duration = Duration::from_millis(250);

struct MessagingInner {
    runtime: ActorRuntime,
    cluster: Cluster,
    behaviors: Arc<BehaviorRegistry>,
    pending: PendingCalls,
    monitors: Mutex<MonitorTable>,
}

#[derive(Clone)]
pub struct RemoteMessaging {
    inner: Arc<MessagingInner>,
}

impl RemoteMessaging {
    pub fn new(runtime: ActorRuntime, cluster: Cluster, behaviors: Arc<BehaviorRegistry>) -> Self {
        Self {
            inner: Arc::new(MessagingInner {
                runtime,
                cluster,
                behaviors,
                pending: PendingCalls::new(),
                monitors: Mutex::new(MonitorTable::default()),
            }),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        self.inner.runtime.node()
    }

    pub fn runtime(&self) -> &ActorRuntime {
        &self.inner.runtime
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    fn is_local(&self, node: &NodeId) -> bool {
        node == self.local_node()
    }

    pub(crate) fn send_message(&self, node: &NodeId, msg: &RemoteMessage) -> Result<()> {
        let bytes = msg.to_bytes()?;
        trace!(node = %node, kind = msg.kind(), bytes = bytes.len(), "Sending remote message");
        self.inner
            .cluster
            .send(node, bytes)
            .map_err(|_| ActorError::node_down(node))
    }

    /// Send to every connected node, returning how many links took it
    pub(crate) fn broadcast_message(&self, msg: &RemoteMessage) -> Result<usize> {
        Ok(self.inner.cluster.broadcast(msg.to_bytes()?))
    }

    async fn request(
        &self,
        node: &NodeId,
        timeout: Duration,
        subject: &str,
        build: impl FnOnce(u64) -> RemoteMessage,
    ) -> Result<ReplyBody> {
        let timeout_ms = timeout.as_millis() as u64;
        let (call_id, mut rx) = self.inner.pending.register(node, timeout_ms);
        if let Err(e) = self.send_message(node, &build(call_id)) {
            self.inner.pending.expire(call_id);
            return Err(e);
        }

        let timed_out = || ActorError::RemoteCallTimeout {
            process: subject.to_string(),
            node: node.to_string(),
            timeout_ms,
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActorError::node_down(node)),
            Err(_) => {
                if self.inner.pending.expire(call_id) {
                    Err(timed_out())
                } else {
                    // Completed while the timer fired; the value is already queued
                    rx.try_recv().unwrap_or_else(|_| Err(timed_out()))
                }
            }
        }
    }

    /// Typed request/response to a process anywhere in the cluster
    pub async fn call<B: Behavior>(
        &self,
        target: &ProcessRef,
        msg: B::Call,
        timeout: Option<Duration>,
    ) -> Result<B::Reply> {
        if self.is_local(&target.node) {
            return self.inner.runtime.call::<B>(target, msg, timeout).await;
        }
        let reply = self
            .call_encoded(target, Payload::encode(&msg)?, timeout)
            .await?;
        reply.decode()
    }

    pub async fn call_encoded(
        &self,
        target: &ProcessRef,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload> {
        let timeout = timeout.unwrap_or_else(|| self.inner.runtime.call_timeout());
        if self.is_local(&target.node) {
            let (tx, rx) = oneshot::channel();
            self.inner.runtime.call_encoded(target, payload, tx)?;
            return match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ActorError::process_exited(target, ExitReason::Killed)),
                Err(_) => Err(ActorError::CallTimeout {
                    process: target.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
        }

        let timeout_ms = timeout.as_millis() as u64;
        let body = self
            .request(&target.node, timeout, &target.to_string(), |call_id| {
                RemoteMessage::CallRequest {
                    call_id,
                    target: target.id,
                    payload,
                    timeout_ms,
                }
            })
            .await?;
        match body {
            ReplyBody::Payload(payload) => Ok(payload),
            other => Err(ActorError::invalid(format!("unexpected call reply {:?}", other))),
        }
    }

    /// Fire-and-forget. Remote casts are best-effort: without a link the
    /// message is dropped.
    pub fn cast<B: Behavior>(&self, target: &ProcessRef, msg: B::Cast) -> Result<()> {
        if self.is_local(&target.node) {
            return self.inner.runtime.cast::<B>(target, msg);
        }
        let msg = RemoteMessage::Cast {
            target: target.id,
            payload: Payload::encode(&msg)?,
        };
        if let Err(e) = self.send_message(&target.node, &msg) {
            debug!(process = %target, error = %e, "Dropping cast to unreachable node");
        }
        Ok(())
    }

    /// Spawn the behavior registered as `behavior` on `node`
    pub async fn spawn(
        &self,
        node: &NodeId,
        behavior: &str,
        args: Payload,
        timeout: Option<Duration>,
    ) -> Result<ProcessRef> {
        let timeout = timeout.unwrap_or_else(|| self.inner.runtime.call_timeout());
        if self.is_local(node) {
            let opts = SpawnOptions::default().init_timeout(timeout);
            return self
                .inner
                .behaviors
                .spawn(&self.inner.runtime, behavior, args, opts)
                .await;
        }

        let timeout_ms = timeout.as_millis() as u64;
        let body = self
            .request(node, timeout + REPLY_MARGIN, behavior, |call_id| {
                RemoteMessage::SpawnRequest {
                    call_id,
                    behavior: behavior.to_string(),
                    args,
                    timeout_ms,
                }
            })
            .await?;
        match body {
            ReplyBody::Spawned(process) => {
                debug!(node = %node, behavior, process = %process, "Spawned remote process");
                Ok(process)
            }
            other => Err(ActorError::invalid(format!("unexpected spawn reply {:?}", other))),
        }
    }

    pub async fn stop(&self, target: &ProcessRef, reason: ExitReason, timeout: Duration) -> Result<()> {
        if self.is_local(&target.node) {
            return self.inner.runtime.stop(target, reason, timeout).await;
        }

        let timeout_ms = timeout.as_millis() as u64;
        let body = self
            .request(&target.node, timeout + REPLY_MARGIN, &target.to_string(), |call_id| {
                RemoteMessage::StopRequest {
                    call_id,
                    target: target.id,
                    reason,
                    timeout_ms,
                }
            })
            .await?;
        match body {
            ReplyBody::Stopped => Ok(()),
            other => Err(ActorError::invalid(format!("unexpected stop reply {:?}", other))),
        }
    }

    /// Deliver a [`SystemMessage::ProcessDown`] to `watcher` when `target` exits
    pub fn monitor(&self, watcher: &ProcessRef, target: &ProcessRef) -> Result<MonitorId> {
        if !self.is_local(&watcher.node) {
            return Err(ActorError::invalid(format!(
                "watcher {} must be a local process",
                watcher
            )));
        }
        Ok(self.watch(Watcher::Process(watcher.clone()), target))
    }

    /// Send a [`ProcessDown`] into `tx` when `target` exits
    pub fn monitor_channel(
        &self,
        target: &ProcessRef,
        tx: mpsc::UnboundedSender<ProcessDown>,
    ) -> MonitorId {
        self.watch(Watcher::Channel(tx), target)
    }

    fn watch(&self, watcher: Watcher, target: &ProcessRef) -> MonitorId {
        let monitor = MonitorId::new();
        let immediate = {
            let mut table = self.inner.monitors.lock();
            if self.is_local(&target.node) {
                if self.inner.runtime.is_alive(target) {
                    table.watch_local(monitor, target.clone(), watcher);
                    None
                } else {
                    Some((watcher, ExitReason::NoProc))
                }
            } else {
                // Registered under the lock so a concurrent node loss cannot
                // slip between the request and the table entry
                let request = RemoteMessage::MonitorRequest {
                    monitor,
                    target: target.id,
                };
                match self.send_message(&target.node, &request) {
                    Ok(()) => {
                        table.watch_remote(monitor, target.clone(), watcher);
                        None
                    }
                    Err(_) => Some((watcher, ExitReason::NodeDown(target.node.clone()))),
                }
            }
        };

        if let Some((watcher, reason)) = immediate {
            self.deliver(Delivery {
                watcher,
                down: ProcessDown {
                    monitor,
                    process: target.clone(),
                    reason,
                },
            });
        }
        monitor
    }

    /// Cancel a monitor; false if it already fired or never existed
    pub fn demonitor(&self, monitor: &MonitorId) -> bool {
        let (removed, remote) = self.inner.monitors.lock().remove(monitor);
        if let Some(node) = remote {
            let _ = self.send_message(&node, &RemoteMessage::Demonitor { monitor: *monitor });
        }
        removed
    }

    fn deliver(&self, delivery: Delivery) {
        let Delivery { watcher, down } = delivery;
        match watcher {
            Watcher::Process(process) => {
                if !self.inner.runtime.send_info(&process, SystemMessage::ProcessDown(down)) {
                    trace!(watcher = %process, "Watcher gone before its monitor fired");
                }
            }
            Watcher::Channel(tx) => {
                let _ = tx.send(down);
            }
            Watcher::Remote(node) => {
                let msg = RemoteMessage::ProcessDown {
                    monitor: down.monitor,
                    process: down.process,
                    reason: down.reason,
                };
                if let Err(e) = self.send_message(&node, &msg) {
                    debug!(node = %node, error = %e, "Could not report process exit");
                }
            }
        }
    }

    /// A local process exited
    pub fn on_local_exit(&self, process: &ProcessRef, reason: &ExitReason) {
        let (deliveries, cancels) = self.inner.monitors.lock().process_exited(process, reason);
        for delivery in deliveries {
            self.deliver(delivery);
        }
        for (node, monitor) in cancels {
            let _ = self.send_message(&node, &RemoteMessage::Demonitor { monitor });
        }
    }

    /// Fail requests to `node` and fire monitors on its processes
    pub fn on_node_down(&self, node: &NodeId) {
        let failed = self.inner.pending.fail_node(node);
        let deliveries = self.inner.monitors.lock().node_down(node);
        if failed > 0 || !deliveries.is_empty() {
            info!(
                node = %node,
                failed_requests = failed,
                fired_monitors = deliveries.len(),
                "Node down, failing its requests and monitors"
            );
        }
        for delivery in deliveries {
            self.deliver(delivery);
        }
    }

    /// Fail every outstanding request; used when the local node stops
    pub fn fail_pending(&self) -> usize {
        self.inner
            .pending
            .fail_all(&ActorError::node_down(self.local_node()))
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.monitors.lock().len()
    }

    fn reply(&self, to: &NodeId, call_id: u64, result: Result<ReplyBody>) {
        let msg = RemoteMessage::Reply {
            call_id,
            result: result.map_err(|e| RemoteFailure::from(&e)),
        };
        if let Err(e) = self.send_message(to, &msg) {
            debug!(node = %to, call_id, error = %e, "Reply dropped, requester unreachable");
        }
    }

    /// Handle a message received from `from`
    ///
    /// Synchronous so the caller can feed messages strictly in arrival
    /// order; anything that waits runs in its own task.
    pub fn handle_inbound(&self, from: &NodeId, msg: RemoteMessage) {
        let local = self.local_node().clone();
        match msg {
            RemoteMessage::CallRequest {
                call_id,
                target,
                payload,
                timeout_ms,
            } => {
                let target = ProcessRef::new(target, local);
                let (tx, rx) = oneshot::channel();
                if let Err(e) = self.inner.runtime.call_encoded(&target, payload, tx) {
                    self.reply(from, call_id, Err(e));
                    return;
                }

                let this = self.clone();
                let from = from.clone();
                tokio::spawn(async move {
                    let result =
                        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                            Ok(Ok(result)) => result.map(ReplyBody::Payload),
                            Ok(Err(_)) => Err(ActorError::process_exited(&target, ExitReason::Killed)),
                            Err(_) => Err(ActorError::CallTimeout {
                                process: target.to_string(),
                                timeout_ms,
                            }),
                        };
                    this.reply(&from, call_id, result);
                });
            }
            RemoteMessage::Cast { target, payload } => {
                let target = ProcessRef::new(target, local);
                if let Err(e) = self.inner.runtime.cast_encoded(&target, payload) {
                    debug!(process = %target, from = %from, error = %e, "Dropping remote cast");
                }
            }
            RemoteMessage::SpawnRequest {
                call_id,
                behavior,
                args,
                timeout_ms,
            } => {
                let this = self.clone();
                let from = from.clone();
                tokio::spawn(async move {
                    let opts = SpawnOptions::default().init_timeout(Duration::from_millis(timeout_ms));
                    let result = this
                        .inner
                        .behaviors
                        .spawn(&this.inner.runtime, &behavior, args, opts)
                        .await
                        .map(ReplyBody::Spawned);
                    if let Err(e) = &result {
                        warn!(from = %from, behavior = %behavior, error = %e, "Remote spawn failed");
                    }
                    this.reply(&from, call_id, result);
                });
            }
            RemoteMessage::StopRequest {
                call_id,
                target,
                reason,
                timeout_ms,
            } => {
                let this = self.clone();
                let from = from.clone();
                tokio::spawn(async move {
                    let target = ProcessRef::new(target, local);
                    let result = this
                        .inner
                        .runtime
                        .stop(&target, reason, Duration::from_millis(timeout_ms))
                        .await
                        .map(|_| ReplyBody::Stopped);
                    this.reply(&from, call_id, result);
                });
            }
            RemoteMessage::MonitorRequest { monitor, target } => {
                let target = ProcessRef::new(target, local);
                let alive = {
                    let mut table = self.inner.monitors.lock();
                    let alive = self.inner.runtime.is_alive(&target);
                    if alive {
                        table.watch_local(monitor, target.clone(), Watcher::Remote(from.clone()));
                    }
                    alive
                };
                if !alive {
                    self.deliver(Delivery {
                        watcher: Watcher::Remote(from.clone()),
                        down: ProcessDown {
                            monitor,
                            process: target,
                            reason: ExitReason::NoProc,
                        },
                    });
                }
            }
            RemoteMessage::Demonitor { monitor } => {
                self.inner.monitors.lock().remove(&monitor);
            }
            RemoteMessage::ProcessDown {
                monitor,
                process,
                reason,
            } => {
                let delivery = self.inner.monitors.lock().remote_down(monitor, process, reason);
                if let Some(delivery) = delivery {
                    self.deliver(delivery);
                }
            }
            RemoteMessage::Reply { call_id, result } => {
                if !self.inner.pending.complete_remote(call_id, result) {
                    debug!(from = %from, call_id, "Discarding reply for unknown or expired request");
                }
            }
            RemoteMessage::Registry(_) => {
                warn!(from = %from, "Registry message reached the messaging layer");
            }
        }
    }
}
