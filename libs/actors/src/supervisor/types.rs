//! Supervisor specifications and reports

use crate::error::Result;
use crate::messages::{ExitReason, Payload};
use crate::process::ProcessRef;
use network::NodeId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default grace period for a child's `terminate`
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SupervisorId(Uuid);

impl SupervisorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SupervisorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SupervisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sup-{}", self.0.simple())
    }
}

/// What happens to the siblings of a failed child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Restart only the failed child
    OneForOne,
    /// Restart every child
    OneForAll,
    /// Restart the failed child and every child started after it
    RestForOne,
    /// Like `OneForOne`, for children created from one template
    SimpleOneForOne,
}

/// Which exits lead to a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always
    Permanent,
    /// Only after an abnormal exit
    Transient,
    /// Never
    Temporary,
}

impl RestartPolicy {
    pub fn restarts_after(&self, reason: &ExitReason) -> bool {
        match self {
            RestartPolicy::Permanent => true,
            RestartPolicy::Transient => !reason.is_normal(),
            RestartPolicy::Temporary => false,
        }
    }
}

/// How a node is picked for a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    #[default]
    LocalFirst,
    RoundRobin,
    LeastLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChildPlacement {
    /// Use the supervisor's policy
    #[default]
    Inherit,
    Policy(PlacementPolicy),
    /// Always this node while it is reachable
    Pinned(NodeId),
}

/// When the exit of significant children stops the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoShutdown {
    #[default]
    Never,
    AnySignificant,
    AllSignificant,
}

/// At most `max_restarts` within any `within` window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartIntensity {
    pub max_restarts: u32,
    pub within: Duration,
}

impl Default for RestartIntensity {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            within: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub id: String,
    /// Name in the [`crate::BehaviorRegistry`] of the node that runs the child
    pub behavior: String,
    pub args: Payload,
    pub restart: RestartPolicy,
    pub shutdown_timeout: Duration,
    pub significant: bool,
    pub placement: ChildPlacement,
}

impl ChildSpec {
    pub fn new(id: impl Into<String>, behavior: impl Into<String>, args: Payload) -> Self {
        Self {
            id: id.into(),
            behavior: behavior.into(),
            args,
            restart: RestartPolicy::Permanent,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            significant: false,
            placement: ChildPlacement::Inherit,
        }
    }

    /// Encode `args` for the child's `init`
    pub fn with_args<A: Serialize>(
        id: impl Into<String>,
        behavior: impl Into<String>,
        args: &A,
    ) -> Result<Self> {
        Ok(Self::new(id, behavior, Payload::encode(args)?))
    }

    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn significant(mut self, significant: bool) -> Self {
        self.significant = significant;
        self
    }

    pub fn placement(mut self, placement: ChildPlacement) -> Self {
        self.placement = placement;
        self
    }
}

/// Blueprint for `SimpleOneForOne` children; only the args vary
#[derive(Debug, Clone)]
pub struct ChildTemplate {
    pub behavior: String,
    pub restart: RestartPolicy,
    pub shutdown_timeout: Duration,
    pub placement: ChildPlacement,
}

impl ChildTemplate {
    pub fn new(behavior: impl Into<String>) -> Self {
        Self {
            behavior: behavior.into(),
            restart: RestartPolicy::Permanent,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            placement: ChildPlacement::Inherit,
        }
    }

    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn placement(mut self, placement: ChildPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub(crate) fn instantiate(&self, id: String, args: Payload) -> ChildSpec {
        ChildSpec {
            id,
            behavior: self.behavior.clone(),
            args,
            restart: self.restart,
            shutdown_timeout: self.shutdown_timeout,
            significant: false,
            placement: self.placement.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    pub name: String,
    pub strategy: Strategy,
    pub intensity: RestartIntensity,
    pub placement: PlacementPolicy,
    pub auto_shutdown: AutoShutdown,
    pub children: Vec<ChildSpec>,
    pub template: Option<ChildTemplate>,
    /// How long to wait for each child's `init`
    pub start_timeout: Duration,
}

impl SupervisorSpec {
    pub fn new(name: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            intensity: RestartIntensity::default(),
            placement: PlacementPolicy::default(),
            auto_shutdown: AutoShutdown::default(),
            children: Vec::new(),
            template: None,
            start_timeout: Duration::from_secs(5),
        }
    }

    pub fn child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn template(mut self, template: ChildTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn intensity(mut self, max_restarts: u32, within: Duration) -> Self {
        self.intensity = RestartIntensity {
            max_restarts,
            within,
        };
        self
    }

    pub fn placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    pub fn auto_shutdown(mut self, auto_shutdown: AutoShutdown) -> Self {
        self.auto_shutdown = auto_shutdown;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub id: String,
    pub process: Option<ProcessRef>,
    pub restart: RestartPolicy,
    pub significant: bool,
    pub restart_count: u32,
    pub uptime: Option<Duration>,
}

impl ChildInfo {
    pub fn node(&self) -> Option<&NodeId> {
        self.process.as_ref().map(|p| &p.node)
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildCounts {
    pub specs: usize,
    pub active: usize,
}

#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub id: SupervisorId,
    pub name: String,
    pub strategy: Strategy,
    pub children: usize,
    pub active_children: usize,
    pub total_restarts: u64,
    pub migrations: u64,
    pub children_per_node: HashMap<NodeId, usize>,
    pub uptime: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    ChildStarted {
        child: String,
        process: ProcessRef,
    },
    ChildRestarted {
        child: String,
        process: ProcessRef,
        restart_count: u32,
    },
    ChildTerminated {
        child: String,
        reason: ExitReason,
    },
    ChildMigrated {
        child: String,
        from: NodeId,
        to: NodeId,
        process: ProcessRef,
    },
    NodeFailureDetected {
        node: NodeId,
        affected: Vec<String>,
    },
    MaxRestartsExceeded {
        restarts: u32,
        within: Duration,
    },
    SupervisorStopped {
        reason: ExitReason,
    },
}

/// Runtime state of one child inside the supervisor
#[derive(Debug)]
pub(crate) struct Child {
    pub spec: ChildSpec,
    pub process: Option<ProcessRef>,
    pub monitor: Option<crate::messages::MonitorId>,
    pub restart_count: u32,
    pub started_at: Option<Instant>,
}

impl Child {
    pub(crate) fn new(spec: ChildSpec) -> Self {
        Self {
            spec,
            process: None,
            monitor: None,
            restart_count: 0,
            started_at: None,
        }
    }

    pub(crate) fn info(&self) -> ChildInfo {
        ChildInfo {
            id: self.spec.id.clone(),
            process: self.process.clone(),
            restart: self.spec.restart,
            significant: self.spec.significant,
            restart_count: self.restart_count,
            uptime: self.started_at.map(|t| t.elapsed()),
        }
    }
}
