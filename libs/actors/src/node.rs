//! Node
//!
//! Wires one node together: cluster membership, the local runtime, remote
//! messaging, the global registry and the supervisors started here. Three
//! background loops feed the upper layers:
//!
//! - inbound frames, decoded and dispatched in arrival order,
//! - cluster membership events (registry sync on node up, failure
//!   propagation on node down),
//! - local process lifecycle events (monitors and name release).
//!
//! A fourth loop pushes periodic registry snapshots.

use crate::behaviors::{Behavior, BehaviorRegistry};
use crate::error::{ActorError, Result};
use crate::global::GlobalRegistry;
use crate::messages::{ExitReason, MonitorId, Payload, ProcessDown};
use crate::process::ProcessRef;
use crate::remote::{RemoteMessage, RemoteMessaging};
use crate::supervisor::{SupervisorId, SupervisorRef, SupervisorSpec, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::system::{ActorRuntime, LifecycleEvent};
use dashmap::DashMap;
use network::{Cluster, ClusterConfig, ClusterEvent, InboundFrame, NodeId, Subscription};
use node_config::NodeConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct NodeInner {
    config: NodeConfig,
    cluster: Cluster,
    runtime: ActorRuntime,
    messaging: RemoteMessaging,
    registry: GlobalRegistry,
    supervisors: DashMap<SupervisorId, SupervisorRef>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// A running cluster node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Validate `config`, bind, wire the layers together and join the cluster
    pub async fn start(config: NodeConfig, behaviors: Arc<BehaviorRegistry>) -> Result<Self> {
        config.validate().map_err(|e| ActorError::Configuration {
            message: e.to_string(),
        })?;

        let cluster = Cluster::bind(ClusterConfig::from(&config)).await?;
        let runtime =
            ActorRuntime::with_call_timeout(cluster.id().clone(), config.default_call_timeout());
        let messaging = RemoteMessaging::new(runtime.clone(), cluster.clone(), behaviors);
        let registry = GlobalRegistry::new(messaging.clone());

        // Subscribe before joining so no early membership event is missed
        let cluster_events = cluster.subscribe();
        let lifecycle = runtime.subscribe();
        let inbound = cluster
            .take_inbound()
            .ok_or_else(|| ActorError::invalid("cluster inbound stream already taken"))?;

        let tasks = vec![
            tokio::spawn(inbound_loop(inbound, messaging.clone(), registry.clone())),
            tokio::spawn(membership_loop(
                cluster_events,
                messaging.clone(),
                registry.clone(),
            )),
            tokio::spawn(lifecycle_loop(lifecycle, messaging.clone(), registry.clone())),
            tokio::spawn(registry_sync_loop(
                registry.clone(),
                config.registry_sync_interval(),
            )),
        ];

        cluster.join();
        info!(
            node = %cluster.id(),
            addr = %cluster.local_addr(),
            seeds = config.seeds.len(),
            "Node started"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                cluster,
                runtime,
                messaging,
                registry,
                supervisors: DashMap::new(),
                tasks: Mutex::new(tasks),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &NodeId {
        self.inner.cluster.id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    pub fn runtime(&self) -> &ActorRuntime {
        &self.inner.runtime
    }

    pub fn messaging(&self) -> &RemoteMessaging {
        &self.inner.messaging
    }

    pub fn registry(&self) -> &GlobalRegistry {
        &self.inner.registry
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.inner.cluster.connected_nodes()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Spawn a behavior instance on this node
    pub async fn spawn<B: Behavior>(&self, behavior: B, args: B::Args) -> Result<ProcessRef> {
        self.inner.runtime.spawn(behavior, args).await
    }

    /// Spawn the behavior registered as `behavior` on `node`
    pub async fn spawn_remote<A: Serialize>(
        &self,
        node: &NodeId,
        behavior: &str,
        args: &A,
    ) -> Result<ProcessRef> {
        self.inner
            .messaging
            .spawn(node, behavior, Payload::encode(args)?, None)
            .await
    }

    pub async fn call<B: Behavior>(&self, target: &ProcessRef, msg: B::Call) -> Result<B::Reply> {
        self.inner.messaging.call::<B>(target, msg, None).await
    }

    pub async fn call_timeout<B: Behavior>(
        &self,
        target: &ProcessRef,
        msg: B::Call,
        timeout: Duration,
    ) -> Result<B::Reply> {
        self.inner.messaging.call::<B>(target, msg, Some(timeout)).await
    }

    pub fn cast<B: Behavior>(&self, target: &ProcessRef, msg: B::Cast) -> Result<()> {
        self.inner.messaging.cast::<B>(target, msg)
    }

    /// Call the process registered under the global `name`
    pub async fn call_name<B: Behavior>(&self, name: &str, msg: B::Call) -> Result<B::Reply> {
        let target = self.inner.registry.lookup(name)?;
        self.call::<B>(&target, msg).await
    }

    pub fn cast_name<B: Behavior>(&self, name: &str, msg: B::Cast) -> Result<()> {
        let target = self.inner.registry.lookup(name)?;
        self.cast::<B>(&target, msg)
    }

    pub async fn stop_process(&self, target: &ProcessRef, reason: ExitReason) -> Result<()> {
        self.inner
            .messaging
            .stop(target, reason, DEFAULT_SHUTDOWN_TIMEOUT)
            .await
    }

    pub fn monitor(&self, watcher: &ProcessRef, target: &ProcessRef) -> Result<MonitorId> {
        self.inner.messaging.monitor(watcher, target)
    }

    pub fn monitor_channel(
        &self,
        target: &ProcessRef,
        tx: mpsc::UnboundedSender<ProcessDown>,
    ) -> MonitorId {
        self.inner.messaging.monitor_channel(target, tx)
    }

    pub fn demonitor(&self, monitor: &MonitorId) -> bool {
        self.inner.messaging.demonitor(monitor)
    }

    pub fn register_name(&self, name: &str, process: &ProcessRef) -> Result<()> {
        self.inner.registry.register(name, process).map(|_| ())
    }

    pub fn unregister_name(&self, name: &str) -> Result<()> {
        self.inner.registry.unregister(name)
    }

    pub fn whereis(&self, name: &str) -> Option<ProcessRef> {
        self.inner.registry.whereis(name)
    }

    pub async fn start_supervisor(&self, spec: SupervisorSpec) -> Result<SupervisorRef> {
        if !self.is_running() {
            return Err(ActorError::invalid("node is stopping"));
        }
        let supervisor = SupervisorRef::start(self.inner.messaging.clone(), spec).await?;
        self.inner
            .supervisors
            .insert(supervisor.id(), supervisor.clone());
        Ok(supervisor)
    }

    /// Handle to a supervisor started on this node that is still running
    pub fn supervisor(&self, id: SupervisorId) -> Result<SupervisorRef> {
        let found = self.inner.supervisors.get(&id).map(|s| s.clone());
        match found {
            Some(supervisor) if supervisor.is_running() => Ok(supervisor),
            Some(_) => {
                self.inner.supervisors.remove(&id);
                Err(ActorError::SupervisorNotFound {
                    supervisor: id.to_string(),
                })
            }
            None => Err(ActorError::SupervisorNotFound {
                supervisor: id.to_string(),
            }),
        }
    }

    pub fn supervisors(&self) -> Vec<SupervisorRef> {
        self.inner.supervisors.retain(|_, s| s.is_running());
        self.inner
            .supervisors
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Graceful shutdown: supervisors first, then the remaining processes,
    /// then pending requests and finally the cluster links
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.id(), "Stopping node");

        let supervisors: Vec<SupervisorRef> = self
            .inner
            .supervisors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for supervisor in supervisors {
            if let Err(e) = supervisor.stop(ExitReason::Shutdown).await {
                debug!(supervisor = %supervisor.id(), error = %e, "Supervisor already stopped");
            }
        }
        self.inner.supervisors.clear();

        self.inner.runtime.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
        // Let the lifecycle loop release names before the links go away
        tokio::task::yield_now().await;
        let failed = self.inner.messaging.fail_pending();
        if failed > 0 {
            debug!(failed, "Failed pending requests on shutdown");
        }
        self.inner.cluster.stop().await;
        self.abort_tasks();
        info!(node = %self.id(), "Node stopped");
    }

    /// Abrupt stop without goodbyes or `terminate` callbacks, as if the
    /// host had crashed
    pub fn kill(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(node = %self.id(), "Killing node");
        self.inner.cluster.kill();
        self.inner.runtime.abort_all();
        self.abort_tasks();
        self.inner.supervisors.clear();
    }

    fn abort_tasks(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn inbound_loop(
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    messaging: RemoteMessaging,
    registry: GlobalRegistry,
) {
    while let Some(frame) = inbound.recv().await {
        match RemoteMessage::from_bytes(&frame.payload) {
            Ok(RemoteMessage::Registry(msg)) => registry.handle_message(&frame.from, msg),
            Ok(msg) => messaging.handle_inbound(&frame.from, msg),
            Err(e) => warn!(from = %frame.from, error = %e, "Dropping undecodable frame"),
        }
    }
    debug!("Inbound stream closed");
}

async fn membership_loop(
    mut events: Subscription<ClusterEvent>,
    messaging: RemoteMessaging,
    registry: GlobalRegistry,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClusterEvent::NodeUp(info) => registry.on_node_up(&info.id),
            ClusterEvent::NodeDown { node, reason } => {
                debug!(node = %node, reason = %reason, "Propagating node down");
                messaging.on_node_down(&node);
                registry.on_node_down(&node);
            }
            ClusterEvent::HandshakeFailed { .. } => {}
        }
    }
}

async fn lifecycle_loop(
    mut events: Subscription<LifecycleEvent>,
    messaging: RemoteMessaging,
    registry: GlobalRegistry,
) {
    while let Some(event) = events.recv().await {
        if let LifecycleEvent::ProcessDown { process, reason } = event {
            messaging.on_local_exit(&process, &reason);
            registry.on_process_exit(&process);
        }
    }
}

async fn registry_sync_loop(registry: GlobalRegistry, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; peers get a snapshot on node up anyway
    interval.tick().await;
    loop {
        interval.tick().await;
        registry.sync();
    }
}
