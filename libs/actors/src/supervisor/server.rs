//! Supervisor task
//!
//! One tokio task per supervisor owns all child state. It reacts to two
//! inputs: commands from [`super::SupervisorRef`] handles, and
//! [`ProcessDown`] notifications from the monitors it holds on its children.
//! A notification whose monitor id is no longer current is stale and
//! ignored, which is what makes node-failure handling idempotent.

use super::placement::Placer;
use super::restart::RestartWindow;
use super::types::{
    AutoShutdown, Child, ChildCounts, ChildInfo, ChildSpec, RestartPolicy, Strategy,
    SupervisorEvent, SupervisorId, SupervisorSpec, SupervisorStats,
};
use crate::error::{ActorError, Result};
use crate::messages::{ExitReason, Payload, ProcessDown};
use crate::process::ProcessRef;
use crate::remote::RemoteMessaging;
use network::{EventBus, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

pub(crate) enum Command {
    StartChild(ChildSpec, oneshot::Sender<Result<ProcessRef>>),
    StartTemplateChild(Payload, oneshot::Sender<Result<(String, ProcessRef)>>),
    TerminateChild(String, oneshot::Sender<Result<()>>),
    RestartChild(String, oneshot::Sender<Result<ProcessRef>>),
    DeleteChild(String, oneshot::Sender<Result<()>>),
    WhichChildren(oneshot::Sender<Vec<ChildInfo>>),
    CountChildren(oneshot::Sender<ChildCounts>),
    Stats(oneshot::Sender<SupervisorStats>),
    Stop(ExitReason, oneshot::Sender<()>),
}

pub(crate) struct SupervisorServer {
    id: SupervisorId,
    spec: SupervisorSpec,
    children: Vec<Child>,
    messaging: RemoteMessaging,
    events: EventBus<SupervisorEvent>,
    window: RestartWindow,
    placer: Placer,
    down_tx: mpsc::UnboundedSender<ProcessDown>,
    total_restarts: u64,
    migrations: u64,
    template_seq: u64,
    started_at: Instant,
}

impl SupervisorServer {
    pub(crate) fn new(
        id: SupervisorId,
        mut spec: SupervisorSpec,
        messaging: RemoteMessaging,
        events: EventBus<SupervisorEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessDown>)> {
        if spec.strategy == Strategy::SimpleOneForOne {
            if spec.template.is_none() {
                return Err(ActorError::invalid("simple_one_for_one needs a child template"));
            }
            if !spec.children.is_empty() {
                return Err(ActorError::invalid(
                    "simple_one_for_one children are created from the template",
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = spec.children.iter().find(|c| !seen.insert(c.id.clone())) {
            return Err(ActorError::invalid(format!("duplicate child id '{}'", dup.id)));
        }

        let children = std::mem::take(&mut spec.children)
            .into_iter()
            .map(Child::new)
            .collect();
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                id,
                window: RestartWindow::new(spec.intensity),
                spec,
                children,
                messaging,
                events,
                placer: Placer::default(),
                down_tx,
                total_restarts: 0,
                migrations: 0,
                template_seq: 0,
                started_at: Instant::now(),
            },
            down_rx,
        ))
    }

    /// Start the static children in order; on failure stop the ones already up
    pub(crate) async fn start_children(&mut self) -> Result<()> {
        for index in 0..self.children.len() {
            if let Err(e) = self.start_process(index, None).await {
                error!(
                    supervisor = %self.id,
                    child = %self.children[index].spec.id,
                    error = %e,
                    "Child failed to start, aborting supervisor start"
                );
                self.terminate_all(ExitReason::Shutdown).await;
                return Err(e);
            }
            self.publish_started(index);
        }
        Ok(())
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut down_rx: mpsc::UnboundedReceiver<ProcessDown>,
        running: Arc<AtomicBool>,
    ) {
        info!(
            supervisor = %self.id,
            name = %self.spec.name,
            strategy = ?self.spec.strategy,
            children = self.children.len(),
            "Supervisor running"
        );

        let mut stop_ack = None;
        let reason = loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break ExitReason::Shutdown;
                    };
                    if let Some((reason, ack)) = self.handle_command(command).await {
                        stop_ack = ack;
                        break reason;
                    }
                }
                Some(down) = down_rx.recv() => {
                    if let Some(reason) = self.on_child_down(down).await {
                        break reason;
                    }
                }
            }
        };

        running.store(false, Ordering::SeqCst);
        self.terminate_all(ExitReason::Shutdown).await;
        info!(supervisor = %self.id, reason = %reason, "Supervisor stopped");
        self.events.publish(SupervisorEvent::SupervisorStopped { reason });
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
    ) -> Option<(ExitReason, Option<oneshot::Sender<()>>)> {
        match command {
            Command::StartChild(spec, reply) => {
                let _ = reply.send(self.add_child(spec).await);
            }
            Command::StartTemplateChild(args, reply) => {
                let _ = reply.send(self.add_template_child(args).await);
            }
            Command::TerminateChild(id, reply) => {
                let _ = reply.send(self.terminate_child(&id).await);
            }
            Command::RestartChild(id, reply) => {
                let _ = reply.send(self.restart_child(&id).await);
            }
            Command::DeleteChild(id, reply) => {
                let _ = reply.send(self.delete_child(&id));
            }
            Command::WhichChildren(reply) => {
                let _ = reply.send(self.children.iter().map(Child::info).collect());
            }
            Command::CountChildren(reply) => {
                let _ = reply.send(ChildCounts {
                    specs: self.children.len(),
                    active: self.children.iter().filter(|c| c.process.is_some()).count(),
                });
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Stop(reason, ack) => return Some((reason, Some(ack))),
        }
        None
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.children.iter().position(|c| c.spec.id == id)
    }

    fn load(&self) -> HashMap<NodeId, usize> {
        let mut load = HashMap::new();
        for process in self.children.iter().filter_map(|c| c.process.as_ref()) {
            *load.entry(process.node.clone()).or_insert(0) += 1;
        }
        load
    }

    fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            id: self.id,
            name: self.spec.name.clone(),
            strategy: self.spec.strategy,
            children: self.children.len(),
            active_children: self.children.iter().filter(|c| c.process.is_some()).count(),
            total_restarts: self.total_restarts,
            migrations: self.migrations,
            children_per_node: self.load(),
            uptime: self.started_at.elapsed(),
        }
    }

    fn publish_started(&self, index: usize) {
        let child = &self.children[index];
        if let Some(process) = &child.process {
            self.events.publish(SupervisorEvent::ChildStarted {
                child: child.spec.id.clone(),
                process: process.clone(),
            });
        }
    }

    /// Spawn the child at `index` on a node chosen by placement and monitor it
    async fn start_process(&mut self, index: usize, avoid: Option<&NodeId>) -> Result<ProcessRef> {
        let placement = self.children[index].spec.placement.clone();
        let peers = self.messaging.cluster().connected_nodes();
        let load = self.load();
        let node = self.placer.choose(
            &placement,
            self.spec.placement,
            self.messaging.local_node(),
            &peers,
            &load,
            avoid,
        );

        let (behavior, args) = {
            let spec = &self.children[index].spec;
            (spec.behavior.clone(), spec.args.clone())
        };
        let process = self
            .messaging
            .spawn(&node, &behavior, args, Some(self.spec.start_timeout))
            .await?;
        let monitor = self.messaging.monitor_channel(&process, self.down_tx.clone());

        let child = &mut self.children[index];
        child.process = Some(process.clone());
        child.monitor = Some(monitor);
        child.started_at = Some(Instant::now());
        debug!(
            supervisor = %self.id,
            child = %child.spec.id,
            process = %process,
            "Child started"
        );
        Ok(process)
    }

    /// Stop the child at `index` if it runs; its monitor is dropped first so
    /// the exit is not mistaken for a failure
    async fn stop_process(&mut self, index: usize, reason: ExitReason) -> bool {
        let child = &mut self.children[index];
        let Some(process) = child.process.take() else {
            return false;
        };
        if let Some(monitor) = child.monitor.take() {
            self.messaging.demonitor(&monitor);
        }
        child.started_at = None;
        let timeout = child.spec.shutdown_timeout;
        let id = child.spec.id.clone();

        if let Err(e) = self.messaging.stop(&process, reason.clone(), timeout).await {
            debug!(supervisor = %self.id, child = %id, error = %e, "Child already gone");
        }
        self.events.publish(SupervisorEvent::ChildTerminated { child: id, reason });
        true
    }

    async fn terminate_all(&mut self, reason: ExitReason) {
        for index in (0..self.children.len()).rev() {
            self.stop_process(index, reason.clone()).await;
        }
    }

    async fn add_child(&mut self, spec: ChildSpec) -> Result<ProcessRef> {
        if self.spec.strategy == Strategy::SimpleOneForOne {
            return Err(ActorError::invalid(
                "simple_one_for_one supervisors only start template children",
            ));
        }
        if self.position(&spec.id).is_some() {
            return Err(ActorError::invalid(format!("child '{}' already exists", spec.id)));
        }
        self.push_and_start(spec).await
    }

    async fn add_template_child(&mut self, args: Payload) -> Result<(String, ProcessRef)> {
        let template = match (&self.spec.strategy, &self.spec.template) {
            (Strategy::SimpleOneForOne, Some(template)) => template.clone(),
            _ => {
                return Err(ActorError::invalid(
                    "template children need a simple_one_for_one supervisor",
                ))
            }
        };
        self.template_seq += 1;
        let id = format!("{}-{}", template.behavior, self.template_seq);
        let process = self.push_and_start(template.instantiate(id.clone(), args)).await?;
        Ok((id, process))
    }

    async fn push_and_start(&mut self, spec: ChildSpec) -> Result<ProcessRef> {
        self.children.push(Child::new(spec));
        let index = self.children.len() - 1;
        match self.start_process(index, None).await {
            Ok(process) => {
                self.publish_started(index);
                Ok(process)
            }
            Err(e) => {
                self.children.remove(index);
                Err(e)
            }
        }
    }

    async fn terminate_child(&mut self, id: &str) -> Result<()> {
        let index = self.position(id).ok_or_else(|| ActorError::ChildNotFound {
            child: id.to_string(),
        })?;
        self.stop_process(index, ExitReason::Shutdown).await;
        if self.spec.strategy == Strategy::SimpleOneForOne {
            self.children.remove(index);
        }
        Ok(())
    }

    async fn restart_child(&mut self, id: &str) -> Result<ProcessRef> {
        let index = self.position(id).ok_or_else(|| ActorError::ChildNotFound {
            child: id.to_string(),
        })?;
        self.stop_process(index, ExitReason::Shutdown).await;
        let process = self.start_process(index, None).await?;
        self.publish_restarted(index, &process);
        Ok(process)
    }

    fn delete_child(&mut self, id: &str) -> Result<()> {
        let index = self.position(id).ok_or_else(|| ActorError::ChildNotFound {
            child: id.to_string(),
        })?;
        if self.children[index].process.is_some() {
            return Err(ActorError::invalid(format!("child '{}' is running", id)));
        }
        self.children.remove(index);
        Ok(())
    }

    fn publish_restarted(&mut self, index: usize, process: &ProcessRef) {
        let child = &mut self.children[index];
        child.restart_count += 1;
        self.events.publish(SupervisorEvent::ChildRestarted {
            child: child.spec.id.clone(),
            process: process.clone(),
            restart_count: child.restart_count,
        });
    }

    /// Consume one unit of restart intensity; `Some` means give up
    fn spend_restart(&mut self) -> Option<ExitReason> {
        let now = Instant::now();
        if self.window.should_restart(now) {
            return None;
        }
        let restarts = self.window.recent(now);
        let within = self.window.within();
        error!(
            supervisor = %self.id,
            restarts,
            within_ms = within.as_millis() as u64,
            "Restart intensity exceeded, shutting down"
        );
        self.events
            .publish(SupervisorEvent::MaxRestartsExceeded { restarts, within });
        Some(ExitReason::Error(
            ActorError::MaxRestartsExceeded {
                supervisor: self.id.to_string(),
                max_restarts: self.spec.intensity.max_restarts,
                within_ms: within.as_millis() as u64,
            }
            .to_string(),
        ))
    }

    /// Start the child at `index` again, retrying failed spawns against the
    /// same intensity budget
    async fn restart_process(
        &mut self,
        index: usize,
        avoid: Option<&NodeId>,
    ) -> std::result::Result<ProcessRef, ExitReason> {
        loop {
            match self.start_process(index, avoid).await {
                Ok(process) => return Ok(process),
                Err(e) => {
                    warn!(
                        supervisor = %self.id,
                        child = %self.children[index].spec.id,
                        error = %e,
                        "Restart attempt failed"
                    );
                    if let Some(reason) = self.spend_restart() {
                        return Err(reason);
                    }
                }
            }
        }
    }

    async fn on_child_down(&mut self, down: ProcessDown) -> Option<ExitReason> {
        let Some(index) = self
            .children
            .iter()
            .position(|c| c.monitor == Some(down.monitor))
        else {
            trace!(supervisor = %self.id, monitor = %down.monitor, "Stale monitor notification");
            return None;
        };

        if let ExitReason::NodeDown(node) = &down.reason {
            return self.on_node_failure(node.clone()).await;
        }

        let (id, restart, significant) = {
            let child = &mut self.children[index];
            child.process = None;
            child.monitor = None;
            child.started_at = None;
            (child.spec.id.clone(), child.spec.restart, child.spec.significant)
        };
        info!(supervisor = %self.id, child = %id, reason = %down.reason, "Child exited");
        self.events.publish(SupervisorEvent::ChildTerminated {
            child: id.clone(),
            reason: down.reason.clone(),
        });

        if !restart.restarts_after(&down.reason) {
            if restart == RestartPolicy::Temporary || self.spec.strategy == Strategy::SimpleOneForOne {
                self.children.remove(index);
            }
            return if significant { self.auto_shutdown() } else { None };
        }

        if let Some(reason) = self.spend_restart() {
            return Some(reason);
        }
        self.total_restarts += 1;
        self.restart_group(index).await
    }

    fn auto_shutdown(&self) -> Option<ExitReason> {
        let stop = match self.spec.auto_shutdown {
            AutoShutdown::Never => false,
            AutoShutdown::AnySignificant => true,
            AutoShutdown::AllSignificant => !self
                .children
                .iter()
                .any(|c| c.spec.significant && c.process.is_some()),
        };
        if stop {
            info!(supervisor = %self.id, "Significant child exited, shutting down");
            Some(ExitReason::Shutdown)
        } else {
            None
        }
    }

    /// Apply the strategy after the child at `failed` died
    async fn restart_group(&mut self, failed: usize) -> Option<ExitReason> {
        let group: Vec<usize> = match self.spec.strategy {
            Strategy::OneForOne | Strategy::SimpleOneForOne => vec![failed],
            Strategy::OneForAll => (0..self.children.len()).collect(),
            Strategy::RestForOne => (failed..self.children.len()).collect(),
        };

        // Siblings stop in reverse start order; only those that were running
        // come back, and temporary ones never do
        let mut restart_ids = Vec::with_capacity(group.len());
        for &index in group.iter().rev() {
            let id = self.children[index].spec.id.clone();
            if index == failed {
                restart_ids.push(id);
            } else if self.stop_process(index, ExitReason::Shutdown).await
                && self.children[index].spec.restart != RestartPolicy::Temporary
            {
                restart_ids.push(id);
            }
        }
        restart_ids.reverse();
        let group_ids: Vec<String> = group
            .iter()
            .map(|&i| self.children[i].spec.id.clone())
            .collect();
        self.children.retain(|c| {
            !(group_ids.contains(&c.spec.id)
                && !restart_ids.contains(&c.spec.id)
                && c.spec.restart == RestartPolicy::Temporary)
        });

        for id in restart_ids {
            let Some(index) = self.position(&id) else { continue };
            match self.restart_process(index, None).await {
                Ok(process) => {
                    info!(supervisor = %self.id, child = %id, process = %process, "Child restarted");
                    self.publish_restarted(index, &process);
                }
                Err(reason) => return Some(reason),
            }
        }
        None
    }

    /// Move every child that lived on `node` elsewhere. Siblings are left
    /// alone and successful migrations do not consume restart intensity.
    async fn on_node_failure(&mut self, node: NodeId) -> Option<ExitReason> {
        let affected: Vec<String> = self
            .children
            .iter()
            .filter(|c| c.process.as_ref().is_some_and(|p| p.node == node))
            .map(|c| c.spec.id.clone())
            .collect();
        if affected.is_empty() {
            return None;
        }

        warn!(
            supervisor = %self.id,
            node = %node,
            children = affected.len(),
            "Node hosting children failed, migrating"
        );
        self.events.publish(SupervisorEvent::NodeFailureDetected {
            node: node.clone(),
            affected: affected.clone(),
        });

        for id in affected {
            let Some(index) = self.position(&id) else { continue };
            let temporary = {
                let child = &mut self.children[index];
                if let Some(monitor) = child.monitor.take() {
                    self.messaging.demonitor(&monitor);
                }
                child.process = None;
                child.started_at = None;
                child.spec.restart == RestartPolicy::Temporary
            };
            if temporary {
                self.children.remove(index);
                self.events.publish(SupervisorEvent::ChildTerminated {
                    child: id,
                    reason: ExitReason::NodeDown(node.clone()),
                });
                continue;
            }

            match self.restart_process(index, Some(&node)).await {
                Ok(process) => {
                    self.migrations += 1;
                    info!(
                        supervisor = %self.id,
                        child = %id,
                        from = %node,
                        to = %process.node,
                        "Child migrated"
                    );
                    self.events.publish(SupervisorEvent::ChildMigrated {
                        child: id,
                        from: node.clone(),
                        to: process.node.clone(),
                        process,
                    });
                }
                Err(reason) => return Some(reason),
            }
        }
        None
    }
}
