//! Actor Runtime
//!
//! Hosts the processes of one node. Each process is a tokio task that owns
//! its behavior, its state and the receiving end of an unbounded mailbox, and
//! handles one envelope at a time. Handler errors and panics are caught and
//! turned into an [`ExitReason::Error`]; they never take the node down.
//!
//! Exactly one [`LifecycleEvent::ProcessDown`] is published per process that
//! finished `init`, whichever way it ends.

use crate::behaviors::Behavior;
use crate::error::{ActorError, Result};
use crate::messages::{ExitReason, Message, Payload, SystemMessage};
use crate::process::{ProcessId, ProcessInfo, ProcessRef, ProcessStatus};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use network::{EventBus, NodeId, Subscription};
use node_config::defaults::messaging;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Published for every process start and exit on this node
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    ProcessStarted { process: ProcessRef, behavior: String },
    ProcessDown { process: ProcessRef, reason: ExitReason },
}

/// Per-spawn options
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Behavior label reported by introspection; defaults to the type name
    pub label: Option<String>,
    /// How long `init` may take; defaults to the runtime's call timeout
    pub init_timeout: Option<Duration>,
}

impl SpawnOptions {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }
}

/// Runtime-wide counters
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub processes_spawned: AtomicU64,
    pub processes_stopped: AtomicU64,
    pub processes_crashed: AtomicU64,
    pub processes_killed: AtomicU64,
    pub init_failures: AtomicU64,
    pub messages_processed: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
}

impl RuntimeMetrics {
    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_processing_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    fn record_exit(&self, reason: &ExitReason) {
        let counter = match reason {
            ExitReason::Killed => &self.processes_killed,
            reason if reason.is_normal() => &self.processes_stopped,
            _ => &self.processes_crashed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStats {
    pub live_processes: usize,
    pub processes_spawned: u64,
    pub processes_stopped: u64,
    pub processes_crashed: u64,
    pub processes_killed: u64,
    pub init_failures: u64,
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
}

pub(crate) enum Envelope<B: Behavior> {
    Call {
        msg: B::Call,
        reply: ReplyTo<B::Reply>,
    },
    Cast(B::Cast),
    Info(SystemMessage),
    Stop {
        reason: ExitReason,
        ack: oneshot::Sender<()>,
    },
}

/// Where a call's reply goes: straight back to a local caller, or encoded
/// for a remote one
pub(crate) enum ReplyTo<R> {
    Typed(oneshot::Sender<Result<R>>),
    Encoded(oneshot::Sender<Result<Payload>>),
}

impl<R: Message> ReplyTo<R> {
    fn send(self, result: Result<R>) {
        match self {
            ReplyTo::Typed(tx) => {
                let _ = tx.send(result);
            }
            ReplyTo::Encoded(tx) => {
                let _ = tx.send(result.and_then(|reply| Payload::encode(&reply)));
            }
        }
    }
}

/// Type-erased sending side of a process mailbox
trait Mailbox: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn call_encoded(&self, payload: Payload, reply: oneshot::Sender<Result<Payload>>) -> Result<()>;
    fn cast_encoded(&self, payload: Payload) -> Result<()>;
    fn info(&self, msg: SystemMessage) -> bool;
    fn stop(&self, reason: ExitReason, ack: oneshot::Sender<()>) -> bool;
}

struct TypedMailbox<B: Behavior> {
    process: ProcessRef,
    tx: mpsc::UnboundedSender<Envelope<B>>,
}

impl<B: Behavior> TypedMailbox<B> {
    fn send(&self, envelope: Envelope<B>) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| ActorError::process_not_found(&self.process))
    }
}

impl<B: Behavior> Mailbox for TypedMailbox<B> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn call_encoded(&self, payload: Payload, reply: oneshot::Sender<Result<Payload>>) -> Result<()> {
        let msg = payload.decode::<B::Call>()?;
        self.send(Envelope::Call {
            msg,
            reply: ReplyTo::Encoded(reply),
        })
    }

    fn cast_encoded(&self, payload: Payload) -> Result<()> {
        let msg = payload.decode::<B::Cast>()?;
        self.send(Envelope::Cast(msg))
    }

    fn info(&self, msg: SystemMessage) -> bool {
        self.tx.send(Envelope::Info(msg)).is_ok()
    }

    fn stop(&self, reason: ExitReason, ack: oneshot::Sender<()>) -> bool {
        self.tx.send(Envelope::Stop { reason, ack }).is_ok()
    }
}

struct ProcessEntry {
    behavior: String,
    status: ProcessStatus,
    started_at: Instant,
    mailbox: Arc<dyn Mailbox>,
    task: Option<AbortHandle>,
    handled: Arc<AtomicU64>,
}

struct RuntimeInner {
    node: NodeId,
    call_timeout: Duration,
    processes: DashMap<ProcessId, ProcessEntry>,
    metrics: RuntimeMetrics,
    events: EventBus<LifecycleEvent>,
}

impl RuntimeInner {
    fn mark_running(&self, process: &ProcessRef) {
        let behavior = match self.processes.get_mut(&process.id) {
            Some(mut entry) => {
                entry.status = ProcessStatus::Running;
                entry.behavior.clone()
            }
            None => return,
        };
        self.events.publish(LifecycleEvent::ProcessStarted {
            process: process.clone(),
            behavior,
        });
    }

    /// Remove the process; publishes `ProcessDown` unless it never got past init
    fn process_exited(&self, process: &ProcessRef, reason: ExitReason) {
        let Some((_, entry)) = self.processes.remove(&process.id) else {
            return;
        };
        if entry.status == ProcessStatus::Starting {
            self.metrics.init_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.metrics.record_exit(&reason);
        self.events.publish(LifecycleEvent::ProcessDown {
            process: process.clone(),
            reason,
        });
    }
}

/// The set of processes running on this node
#[derive(Clone)]
pub struct ActorRuntime {
    inner: Arc<RuntimeInner>,
}

impl ActorRuntime {
    pub fn new(node: NodeId) -> Self {
        Self::with_call_timeout(
            node,
            Duration::from_millis(messaging::DEFAULT_CALL_TIMEOUT_MS),
        )
    }

    pub fn with_call_timeout(node: NodeId, call_timeout: Duration) -> Self {
        info!(node = %node, "Creating actor runtime");
        Self {
            inner: Arc::new(RuntimeInner {
                node,
                call_timeout,
                processes: DashMap::new(),
                metrics: RuntimeMetrics::default(),
                events: EventBus::new(),
            }),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    pub fn subscribe(&self) -> Subscription<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub async fn spawn<B: Behavior>(&self, behavior: B, args: B::Args) -> Result<ProcessRef> {
        self.spawn_with(behavior, args, SpawnOptions::default()).await
    }

    /// Start a process and wait for its `init` to finish
    pub async fn spawn_with<B: Behavior>(
        &self,
        behavior: B,
        args: B::Args,
        opts: SpawnOptions,
    ) -> Result<ProcessRef> {
        let process = ProcessRef::new(ProcessId::new(), self.inner.node.clone());
        let label = opts.label.unwrap_or_else(short_type_name::<B>);
        let (tx, rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();
        let handled = Arc::new(AtomicU64::new(0));

        self.inner.processes.insert(
            process.id,
            ProcessEntry {
                behavior: label.clone(),
                status: ProcessStatus::Starting,
                started_at: Instant::now(),
                mailbox: Arc::new(TypedMailbox::<B> {
                    process: process.clone(),
                    tx,
                }),
                task: None,
                handled: handled.clone(),
            },
        );

        let task = ActorTask {
            process: process.clone(),
            behavior,
            receiver: rx,
            runtime: Arc::downgrade(&self.inner),
            handled,
        };
        let handle = tokio::spawn(task.run(args, init_tx));
        if let Some(mut entry) = self.inner.processes.get_mut(&process.id) {
            entry.task = Some(handle.abort_handle());
        }

        let init_timeout = opts.init_timeout.unwrap_or(self.inner.call_timeout);
        match tokio::time::timeout(init_timeout, init_rx).await {
            Ok(Ok(Ok(()))) => {
                self.inner
                    .metrics
                    .processes_spawned
                    .fetch_add(1, Ordering::Relaxed);
                debug!(process = %process, behavior = %label, "Spawned process");
                Ok(process)
            }
            Ok(Ok(Err(message))) => Err(ActorError::init(message)),
            Ok(Err(_)) => Err(ActorError::init("process task ended before init completed")),
            Err(_) => {
                handle.abort();
                warn!(
                    process = %process,
                    behavior = %label,
                    timeout_ms = init_timeout.as_millis() as u64,
                    "Process init timed out"
                );
                self.inner.process_exited(&process, ExitReason::Killed);
                Err(ActorError::init(format!(
                    "init timed out after {}ms",
                    init_timeout.as_millis()
                )))
            }
        }
    }

    fn mailbox(&self, target: &ProcessRef) -> Result<Arc<dyn Mailbox>> {
        if !target.is_on(&self.inner.node) {
            return Err(ActorError::process_not_found(target));
        }
        self.inner
            .processes
            .get(&target.id)
            .map(|entry| entry.mailbox.clone())
            .ok_or_else(|| ActorError::process_not_found(target))
    }

    /// Hand an envelope to a process running `B`
    fn send_typed<B: Behavior>(&self, target: &ProcessRef, envelope: Envelope<B>) -> Result<()> {
        let mailbox = self.mailbox(target)?;
        let typed = mailbox
            .as_any()
            .downcast_ref::<TypedMailbox<B>>()
            .ok_or_else(|| ActorError::BehaviorMismatch {
                process: target.to_string(),
                expected: short_type_name::<B>(),
            })?;
        typed.send(envelope)
    }

    /// Send `msg` and wait for the reply; `None` uses the runtime default
    pub async fn call<B: Behavior>(
        &self,
        target: &ProcessRef,
        msg: B::Call,
        timeout: Option<Duration>,
    ) -> Result<B::Reply> {
        let timeout = timeout.unwrap_or(self.inner.call_timeout);
        let (tx, rx) = oneshot::channel();
        self.send_typed::<B>(
            target,
            Envelope::Call {
                msg,
                reply: ReplyTo::Typed(tx),
            },
        )?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActorError::process_exited(target, ExitReason::Killed)),
            Err(_) => Err(ActorError::CallTimeout {
                process: target.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Fire-and-forget
    pub fn cast<B: Behavior>(&self, target: &ProcessRef, msg: B::Cast) -> Result<()> {
        self.send_typed::<B>(target, Envelope::Cast(msg))
    }

    /// Enqueue an encoded call; the reply is encoded too
    pub(crate) fn call_encoded(
        &self,
        target: &ProcessRef,
        payload: Payload,
        reply: oneshot::Sender<Result<Payload>>,
    ) -> Result<()> {
        self.mailbox(target)?.call_encoded(payload, reply)
    }

    pub(crate) fn cast_encoded(&self, target: &ProcessRef, payload: Payload) -> Result<()> {
        self.mailbox(target)?.cast_encoded(payload)
    }

    /// Deliver a system message to `handle_info`; false if the process is gone
    pub fn send_info(&self, target: &ProcessRef, msg: SystemMessage) -> bool {
        self.mailbox(target)
            .map(|mailbox| mailbox.info(msg))
            .unwrap_or(false)
    }

    /// Ask the process to stop; kill it if `terminate` overruns `timeout`
    pub async fn stop(&self, target: &ProcessRef, reason: ExitReason, timeout: Duration) -> Result<()> {
        let mailbox = self.mailbox(target)?;
        if let Some(mut entry) = self.inner.processes.get_mut(&target.id) {
            if entry.status == ProcessStatus::Running {
                entry.status = ProcessStatus::Stopping;
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if !mailbox.stop(reason, ack_tx) {
            return Err(ActorError::process_not_found(target));
        }
        drop(mailbox);

        if tokio::time::timeout(timeout, ack_rx).await.is_err() {
            warn!(
                process = %target,
                timeout_ms = timeout.as_millis() as u64,
                "Process did not stop in time, killing"
            );
            // Already gone is fine here
            let _ = self.kill(target);
        }
        Ok(())
    }

    /// Stop immediately without running `terminate`
    pub fn kill(&self, target: &ProcessRef) -> Result<()> {
        if !target.is_on(&self.inner.node) {
            return Err(ActorError::process_not_found(target));
        }
        let (_, entry) = self
            .inner
            .processes
            .remove(&target.id)
            .ok_or_else(|| ActorError::process_not_found(target))?;
        if let Some(task) = &entry.task {
            task.abort();
        }

        warn!(process = %target, behavior = %entry.behavior, "Killed process");
        if entry.status != ProcessStatus::Starting {
            self.inner.metrics.record_exit(&ExitReason::Killed);
            self.inner.events.publish(LifecycleEvent::ProcessDown {
                process: target.clone(),
                reason: ExitReason::Killed,
            });
        }
        Ok(())
    }

    pub fn is_alive(&self, target: &ProcessRef) -> bool {
        target.is_on(&self.inner.node) && self.inner.processes.contains_key(&target.id)
    }

    pub fn process_info(&self, target: &ProcessRef) -> Option<ProcessInfo> {
        if !target.is_on(&self.inner.node) {
            return None;
        }
        self.inner.processes.get(&target.id).map(|entry| ProcessInfo {
            process: target.clone(),
            behavior: entry.behavior.clone(),
            status: entry.status,
            uptime: entry.started_at.elapsed(),
            messages_handled: entry.handled.load(Ordering::Relaxed),
        })
    }

    pub fn processes(&self) -> Vec<ProcessRef> {
        self.inner
            .processes
            .iter()
            .map(|entry| ProcessRef::new(*entry.key(), self.inner.node.clone()))
            .collect()
    }

    pub fn process_count(&self) -> usize {
        self.inner.processes.len()
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.inner.metrics
    }

    pub fn stats(&self) -> RuntimeStats {
        let m = &self.inner.metrics;
        RuntimeStats {
            live_processes: self.inner.processes.len(),
            processes_spawned: m.processes_spawned.load(Ordering::Relaxed),
            processes_stopped: m.processes_stopped.load(Ordering::Relaxed),
            processes_crashed: m.processes_crashed.load(Ordering::Relaxed),
            processes_killed: m.processes_killed.load(Ordering::Relaxed),
            init_failures: m.init_failures.load(Ordering::Relaxed),
            messages_processed: m.messages_processed.load(Ordering::Relaxed),
            avg_processing_time_ns: m.avg_processing_time_ns(),
        }
    }

    /// Stop every process with [`ExitReason::Shutdown`], concurrently
    pub async fn shutdown(&self, timeout: Duration) {
        let targets = self.processes();
        info!(
            node = %self.inner.node,
            processes = targets.len(),
            "Shutting down actor runtime"
        );

        let results = join_all(
            targets
                .iter()
                .map(|target| self.stop(target, ExitReason::Shutdown, timeout)),
        )
        .await;
        for (target, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                debug!(process = %target, error = %e, "Process already gone at shutdown");
            }
        }
    }

    /// Abort every process task without events, as if the node died
    pub fn abort_all(&self) {
        let ids: Vec<ProcessId> = self.inner.processes.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.processes.remove(&id) {
                if let Some(task) = entry.task {
                    task.abort();
                }
            }
        }
    }
}

fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic".to_string()
    }
}

/// Run a handler, folding errors and panics into the crash message
async fn guarded<T, F>(handler: F) -> std::result::Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic_message(&*panic)),
    }
}

struct ActorTask<B: Behavior> {
    process: ProcessRef,
    behavior: B,
    receiver: mpsc::UnboundedReceiver<Envelope<B>>,
    runtime: Weak<RuntimeInner>,
    handled: Arc<AtomicU64>,
}

impl<B: Behavior> ActorTask<B> {
    async fn run(
        mut self,
        args: B::Args,
        init_tx: oneshot::Sender<std::result::Result<(), String>>,
    ) {
        let task_start = Instant::now();

        let mut state = match guarded(self.behavior.init(args)).await {
            Ok(state) => state,
            Err(message) => {
                warn!(
                    process = %self.process,
                    error = %message,
                    startup_duration_ms = task_start.elapsed().as_millis() as u64,
                    "Process failed during init"
                );
                if let Some(runtime) = self.runtime.upgrade() {
                    runtime.process_exited(&self.process, ExitReason::Error(message.clone()));
                }
                let _ = init_tx.send(Err(message));
                return;
            }
        };

        if let Some(runtime) = self.runtime.upgrade() {
            runtime.mark_running(&self.process);
        }
        let _ = init_tx.send(Ok(()));
        debug!(
            process = %self.process,
            startup_duration_ms = task_start.elapsed().as_millis() as u64,
            "Process started, entering message loop"
        );

        let mut stop_ack = None;
        let reason = loop {
            let Some(envelope) = self.receiver.recv().await else {
                break ExitReason::Shutdown;
            };
            let start = Instant::now();

            let outcome = match envelope {
                Envelope::Call { msg, reply } => {
                    match guarded(self.behavior.handle_call(msg, &mut state)).await {
                        Ok(value) => {
                            reply.send(Ok(value));
                            Ok(())
                        }
                        Err(message) => {
                            reply.send(Err(ActorError::process_exited(
                                &self.process,
                                ExitReason::Error(message.clone()),
                            )));
                            Err(message)
                        }
                    }
                }
                Envelope::Cast(msg) => guarded(self.behavior.handle_cast(msg, &mut state)).await,
                Envelope::Info(msg) => guarded(self.behavior.handle_info(msg, &mut state)).await,
                Envelope::Stop { reason, ack } => {
                    stop_ack = Some(ack);
                    break reason;
                }
            };

            self.handled.fetch_add(1, Ordering::Relaxed);
            if let Some(runtime) = self.runtime.upgrade() {
                runtime.metrics.record_message_handled(start.elapsed());
            }

            if let Err(message) = outcome {
                error!(
                    process = %self.process,
                    error = %message,
                    processing_duration_ns = start.elapsed().as_nanos() as u64,
                    "Process crashed"
                );
                break ExitReason::Error(message);
            }
        };

        let shutdown_start = Instant::now();
        if let Err(panic) = AssertUnwindSafe(self.behavior.terminate(&reason, &mut state))
            .catch_unwind()
            .await
        {
            warn!(
                process = %self.process,
                error = %panic_message(&*panic),
                "terminate panicked"
            );
        }

        // Anyone still queued learns why the process went away
        self.receiver.close();
        while let Ok(envelope) = self.receiver.try_recv() {
            match envelope {
                Envelope::Call { reply, .. } => {
                    reply.send(Err(ActorError::process_exited(&self.process, &reason)))
                }
                Envelope::Stop { ack, .. } => {
                    let _ = ack.send(());
                }
                Envelope::Cast(_) | Envelope::Info(_) => {}
            }
        }

        debug!(
            process = %self.process,
            reason = %reason,
            shutdown_duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Process exited"
        );
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.process_exited(&self.process, reason);
        }
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    enum CounterCall {
        Get,
        Add(i64),
        Fail,
        Panic,
        Sleep(u64),
    }

    struct Counter;

    #[async_trait]
    impl Behavior for Counter {
        type Args = i64;
        type State = i64;
        type Call = CounterCall;
        type Reply = i64;
        type Cast = i64;

        async fn init(&self, start: i64) -> anyhow::Result<i64> {
            if start < 0 {
                anyhow::bail!("negative start");
            }
            Ok(start)
        }

        async fn handle_call(&self, msg: CounterCall, state: &mut i64) -> anyhow::Result<i64> {
            match msg {
                CounterCall::Get => Ok(*state),
                CounterCall::Add(n) => {
                    *state += n;
                    Ok(*state)
                }
                CounterCall::Fail => anyhow::bail!("asked to fail"),
                CounterCall::Panic => panic!("asked to panic"),
                CounterCall::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(*state)
                }
            }
        }

        async fn handle_cast(&self, n: i64, state: &mut i64) -> anyhow::Result<()> {
            *state += n;
            Ok(())
        }
    }

    struct Other;

    #[async_trait]
    impl Behavior for Other {
        type Args = ();
        type State = ();
        type Call = ();
        type Reply = ();
        type Cast = ();

        async fn init(&self, _: ()) -> anyhow::Result<()> {
            Ok(())
        }
        async fn handle_call(&self, _: (), _: &mut ()) -> anyhow::Result<()> {
            Ok(())
        }
        async fn handle_cast(&self, _: (), _: &mut ()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn runtime() -> ActorRuntime {
        ActorRuntime::with_call_timeout(NodeId::new("local", "127.0.0.1", 1), Duration::from_secs(1))
    }

    async fn next_down(events: &mut Subscription<LifecycleEvent>) -> (ProcessRef, ExitReason) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(LifecycleEvent::ProcessDown { process, reason })) => return (process, reason),
                Ok(Some(_)) => continue,
                other => panic!("no ProcessDown event: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_calls_and_casts_are_handled_in_order() {
        let runtime = runtime();
        let pid = runtime.spawn(Counter, 10).await.unwrap();

        for _ in 0..100 {
            runtime.cast::<Counter>(&pid, 1).unwrap();
        }
        let value = runtime.call::<Counter>(&pid, CounterCall::Get, None).await.unwrap();
        assert_eq!(value, 110);
        assert_eq!(runtime.process_info(&pid).unwrap().messages_handled, 101);
    }

    #[tokio::test]
    async fn test_init_failure_reports_error_and_leaves_nothing_behind() {
        let runtime = runtime();
        let mut events = runtime.subscribe();
        let err = runtime.spawn(Counter, -1).await.unwrap_err();
        assert!(matches!(err, ActorError::Init { ref message } if message.contains("negative")));
        assert_eq!(runtime.process_count(), 0);
        assert_eq!(runtime.stats().init_failures, 1);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_handler_error_crashes_only_that_process() {
        let runtime = runtime();
        let mut events = runtime.subscribe();
        let victim = runtime.spawn(Counter, 0).await.unwrap();
        let bystander = runtime.spawn(Counter, 5).await.unwrap();

        let err = runtime
            .call::<Counter>(&victim, CounterCall::Fail, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::ProcessExited { .. }));

        let (process, reason) = next_down(&mut events).await;
        assert_eq!(process, victim);
        assert!(matches!(reason, ExitReason::Error(ref m) if m.contains("asked to fail")));
        assert!(!runtime.is_alive(&victim));

        let value = runtime.call::<Counter>(&bystander, CounterCall::Get, None).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let runtime = runtime();
        let mut events = runtime.subscribe();
        let pid = runtime.spawn(Counter, 0).await.unwrap();

        assert!(runtime.call::<Counter>(&pid, CounterCall::Panic, None).await.is_err());
        let (_, reason) = next_down(&mut events).await;
        assert!(matches!(reason, ExitReason::Error(ref m) if m.contains("asked to panic")));
        assert_eq!(runtime.stats().processes_crashed, 1);
    }

    #[tokio::test]
    async fn test_call_timeout_and_late_reply_is_discarded() {
        let runtime = runtime();
        let pid = runtime.spawn(Counter, 3).await.unwrap();

        let err = runtime
            .call::<Counter>(&pid, CounterCall::Sleep(200), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::CallTimeout { .. }));

        // The process keeps going and answers the next caller normally
        let value = runtime.call::<Counter>(&pid, CounterCall::Add(1), None).await.unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn test_queued_callers_see_exit() {
        let runtime = runtime();
        let pid = runtime.spawn(Counter, 0).await.unwrap();

        let slow = {
            let runtime = runtime.clone();
            let pid = pid.clone();
            tokio::spawn(async move {
                runtime.call::<Counter>(&pid, CounterCall::Sleep(50), None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        runtime.cast::<Counter>(&pid, 1).unwrap();
        let failing = runtime.call::<Counter>(&pid, CounterCall::Fail, None);
        let queued = runtime.call::<Counter>(&pid, CounterCall::Get, None);
        let (failing, queued) = tokio::join!(failing, queued);

        assert_eq!(slow.await.unwrap().unwrap(), 0);
        assert!(failing.is_err());
        assert!(matches!(queued, Err(ActorError::ProcessExited { .. }) | Err(ActorError::ProcessNotFound { .. })));
    }

    #[tokio::test]
    async fn test_stop_runs_terminate_and_publishes_once() {
        let runtime = runtime();
        let mut events = runtime.subscribe();
        let pid = runtime.spawn(Counter, 0).await.unwrap();

        runtime
            .stop(&pid, ExitReason::Shutdown, Duration::from_secs(1))
            .await
            .unwrap();
        let (process, reason) = next_down(&mut events).await;
        assert_eq!(process, pid);
        assert_eq!(reason, ExitReason::Shutdown);

        assert!(runtime.kill(&pid).is_err());
        assert!(runtime.stop(&pid, ExitReason::Normal, Duration::from_secs(1)).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stop_kills_process_that_overruns() {
        let runtime = runtime();
        let mut events = runtime.subscribe();
        let pid = runtime.spawn(Counter, 0).await.unwrap();

        let busy = runtime.call::<Counter>(&pid, CounterCall::Sleep(500), Some(Duration::from_secs(2)));
        let stop = runtime.stop(&pid, ExitReason::Shutdown, Duration::from_millis(30));
        let (busy, stopped) = tokio::join!(busy, stop);

        stopped.unwrap();
        assert!(busy.is_err());
        let (_, reason) = next_down(&mut events).await;
        assert_eq!(reason, ExitReason::Killed);
        assert!(!runtime.is_alive(&pid));
    }

    #[tokio::test]
    async fn test_behavior_mismatch_and_unknown_process() {
        let runtime = runtime();
        let pid = runtime.spawn(Counter, 0).await.unwrap();

        let err = runtime.call::<Other>(&pid, (), None).await.unwrap_err();
        assert!(matches!(err, ActorError::BehaviorMismatch { .. }));

        let ghost = ProcessRef::new(ProcessId::new(), runtime.node().clone());
        assert!(matches!(
            runtime.cast::<Counter>(&ghost, 1),
            Err(ActorError::ProcessNotFound { .. })
        ));
        assert!(!runtime.send_info(&ghost, SystemMessage::ProcessDown(crate::messages::ProcessDown {
            monitor: crate::messages::MonitorId::new(),
            process: pid.clone(),
            reason: ExitReason::Normal,
        })));
    }

    #[tokio::test]
    async fn test_encoded_call_rejects_wrong_payload_without_crashing() {
        let runtime = runtime();
        let pid = runtime.spawn(Counter, 7).await.unwrap();

        let (tx, _rx) = oneshot::channel();
        let err = runtime
            .call_encoded(&pid, Payload::encode(&"nope".to_string()).unwrap(), tx)
            .unwrap_err();
        assert!(matches!(err, ActorError::Codec { .. }));

        let (tx, rx) = oneshot::channel();
        runtime
            .call_encoded(&pid, Payload::encode(&CounterCall::Get).unwrap(), tx)
            .unwrap();
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.decode::<i64>().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let runtime = runtime();
        for i in 0..5 {
            runtime.spawn(Counter, i).await.unwrap();
        }
        assert_eq!(runtime.process_count(), 5);

        runtime.shutdown(Duration::from_secs(1)).await;
        assert_eq!(runtime.process_count(), 0);
        let stats = runtime.stats();
        assert_eq!(stats.processes_spawned, 5);
        assert_eq!(stats.processes_stopped, 5);
    }
}
