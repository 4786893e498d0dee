//! Distributed Supervisors
//!
//! A supervisor starts child processes from [`ChildSpec`]s, watches them
//! through monitors and restarts them according to its [`Strategy`] and the
//! children's [`RestartPolicy`]. Children may live on any connected node;
//! placement is decided per child by [`PlacementPolicy`] or [`ChildPlacement`].
//!
//! When a node hosting children goes down, those children are started again
//! on a surviving node. This is a migration, not a crash: siblings keep
//! running and the restart budget is left untouched.
//!
//! Restart intensity is a sliding window. Once more than `max_restarts`
//! restarts fall within `within`, the supervisor stops every child and
//! itself, publishing [`SupervisorEvent::MaxRestartsExceeded`] first.

mod placement;
mod restart;
mod server;
mod types;

pub use types::{
    AutoShutdown, ChildCounts, ChildInfo, ChildPlacement, ChildSpec, ChildTemplate,
    PlacementPolicy, RestartIntensity, RestartPolicy, Strategy, SupervisorEvent, SupervisorId,
    SupervisorSpec, SupervisorStats, DEFAULT_SHUTDOWN_TIMEOUT,
};

use crate::error::{ActorError, Result};
use crate::messages::{ExitReason, Payload};
use crate::process::ProcessRef;
use crate::remote::RemoteMessaging;
use network::{EventBus, Subscription};
use serde::Serialize;
use server::{Command, SupervisorServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Handle to a running supervisor
#[derive(Clone)]
pub struct SupervisorRef {
    id: SupervisorId,
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<SupervisorEvent>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for SupervisorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SupervisorRef {
    /// Start the static children in order and hand them to a new supervisor
    /// task. If any child fails to start, the ones already running are
    /// stopped and the error is returned.
    pub async fn start(messaging: RemoteMessaging, spec: SupervisorSpec) -> Result<Self> {
        let id = SupervisorId::new();
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let events = EventBus::new();
        let (mut server, down_rx) = SupervisorServer::new(id, spec, messaging, events.clone())?;
        server.start_children().await?;

        let (commands, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(server.run(rx, down_rx, running.clone()));
        info!(supervisor = %id, name = %name, "Supervisor started");

        Ok(Self {
            id,
            name,
            commands,
            events,
            running,
        })
    }

    pub fn id(&self) -> SupervisorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    pub fn subscribe(&self) -> Subscription<SupervisorEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| self.not_found())?;
        rx.await.map_err(|_| self.not_found())
    }

    fn not_found(&self) -> ActorError {
        ActorError::SupervisorNotFound {
            supervisor: self.id.to_string(),
        }
    }

    /// Add a child and start it; not allowed on `SimpleOneForOne`
    pub async fn start_child(&self, spec: ChildSpec) -> Result<ProcessRef> {
        self.request(|tx| Command::StartChild(spec, tx)).await?
    }

    /// Start a `SimpleOneForOne` child from the template; returns its id
    pub async fn start_template_child<A: Serialize>(&self, args: &A) -> Result<(String, ProcessRef)> {
        let args = Payload::encode(args)?;
        self.request(|tx| Command::StartTemplateChild(args, tx)).await?
    }

    /// Stop a child without restarting it. The spec is kept unless the
    /// supervisor is `SimpleOneForOne`.
    pub async fn terminate_child(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|tx| Command::TerminateChild(id, tx)).await?
    }

    /// Stop the child if it runs, then start it again
    pub async fn restart_child(&self, id: &str) -> Result<ProcessRef> {
        let id = id.to_string();
        self.request(|tx| Command::RestartChild(id, tx)).await?
    }

    /// Forget a terminated child's spec
    pub async fn delete_child(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|tx| Command::DeleteChild(id, tx)).await?
    }

    pub async fn get_children(&self) -> Result<Vec<ChildInfo>> {
        self.request(Command::WhichChildren).await
    }

    pub async fn count_children(&self) -> Result<ChildCounts> {
        self.request(Command::CountChildren).await
    }

    pub async fn get_stats(&self) -> Result<SupervisorStats> {
        self.request(Command::Stats).await
    }

    /// Stop every child in reverse start order, then the supervisor
    pub async fn stop(&self, reason: ExitReason) -> Result<()> {
        self.request(|tx| Command::Stop(reason, tx)).await
    }
}
