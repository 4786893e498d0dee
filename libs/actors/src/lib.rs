//! Distributed Actor Runtime
//!
//! Isolated single-mailbox processes, extended across a cluster of nodes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Node ─────────────────────────────┐
//! │                                                               │
//! │  ┌──────────────────┐   ┌─────────────────┐                   │
//! │  │ SupervisorRef(s) │──▶│ GlobalRegistry  │                   │
//! │  └────────┬─────────┘   └────────┬────────┘                   │
//! │           │                      │                            │
//! │           ▼                      ▼                            │
//! │  ┌───────────────────────────────────────┐                    │
//! │  │ RemoteMessaging                       │  call / cast /     │
//! │  │  pending calls, monitors              │  spawn / monitor   │
//! │  └───────┬───────────────────────┬───────┘                    │
//! │          │ local                 │ remote                     │
//! │          ▼                       ▼                            │
//! │  ┌──────────────┐        ┌────────────────┐                   │
//! │  │ ActorRuntime │        │ Cluster        │◀── heartbeats,    │
//! │  │  processes   │        │  links, events │    gossip         │
//! │  └──────────────┘        └────────────────┘                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Node loss is the one failure model every layer shares: pending calls to
//! the node fail with [`ActorError::NodeDown`], monitors on its processes
//! fire with [`ExitReason::NodeDown`], its registry entries disappear and
//! supervisors migrate the children it hosted.
//!
//! # Example
//!
//! ```rust,no_run
//! use actors::{Behavior, BehaviorRegistry, Node};
//! use async_trait::async_trait;
//! use node_config::NodeConfig;
//! use std::sync::Arc;
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Behavior for Counter {
//!     type Args = i64;
//!     type State = i64;
//!     type Call = ();
//!     type Reply = i64;
//!     type Cast = i64;
//!
//!     async fn init(&self, start: i64) -> anyhow::Result<i64> {
//!         Ok(start)
//!     }
//!
//!     async fn handle_call(&self, _: (), count: &mut i64) -> anyhow::Result<i64> {
//!         Ok(*count)
//!     }
//!
//!     async fn handle_cast(&self, by: i64, count: &mut i64) -> anyhow::Result<()> {
//!         *count += by;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> actors::Result<()> {
//! let behaviors = Arc::new(BehaviorRegistry::new());
//! behaviors.register("counter", || Counter);
//!
//! let node = Node::start(NodeConfig::new("a").with_secret("s3cret"), behaviors).await?;
//! let counter = node.spawn(Counter, 0).await?;
//! node.cast::<Counter>(&counter, 5)?;
//! assert_eq!(node.call::<Counter>(&counter, ()).await?, 5);
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod behaviors;
pub mod error;
pub mod global;
pub mod messages;
pub mod node;
pub mod process;
pub mod remote;
pub mod supervisor;
pub mod system;

pub use behaviors::{Behavior, BehaviorRegistry};
pub use error::{ActorError, Result};
pub use global::{GlobalRegistry, RegistryEntry, RegistryEvent, UnregisterReason};
pub use messages::{ExitReason, Message, MonitorId, Payload, ProcessDown, SystemMessage};
pub use node::Node;
pub use process::{ProcessId, ProcessInfo, ProcessRef, ProcessStatus};
pub use remote::RemoteMessaging;
pub use supervisor::{
    AutoShutdown, ChildInfo, ChildPlacement, ChildSpec, ChildTemplate, PlacementPolicy,
    RestartPolicy, Strategy, SupervisorEvent, SupervisorId, SupervisorRef, SupervisorSpec,
    SupervisorStats,
};
pub use system::{ActorRuntime, LifecycleEvent, RuntimeStats, SpawnOptions};
