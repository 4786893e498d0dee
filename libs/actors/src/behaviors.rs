//! Behaviors
//!
//! A [`Behavior`] is the code a process runs. It is stateless itself: all
//! mutable data lives in `State`, created by `init` and threaded through the
//! handlers. The [`BehaviorRegistry`] maps names to behavior factories so
//! processes can be spawned by name, which is how remote spawns and
//! supervisors create them.

use crate::error::{ActorError, Result};
use crate::messages::{ExitReason, Message, Payload, SystemMessage};
use crate::process::ProcessRef;
use crate::system::{ActorRuntime, SpawnOptions};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Callbacks driven by a process's message loop
///
/// An `Err` from any handler crashes the process with
/// [`ExitReason::Error`]; so does a panic.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    type Args: Message;
    type State: Send + 'static;
    type Call: Message;
    type Reply: Message;
    type Cast: Message;

    async fn init(&self, args: Self::Args) -> anyhow::Result<Self::State>;

    async fn handle_call(
        &self,
        msg: Self::Call,
        state: &mut Self::State,
    ) -> anyhow::Result<Self::Reply>;

    async fn handle_cast(&self, msg: Self::Cast, state: &mut Self::State) -> anyhow::Result<()>;

    async fn handle_info(
        &self,
        _msg: SystemMessage,
        _state: &mut Self::State,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs on every exit except [`ExitReason::Killed`]
    async fn terminate(&self, _reason: &ExitReason, _state: &mut Self::State) {}
}

type SpawnFn = Arc<
    dyn Fn(ActorRuntime, Payload, SpawnOptions) -> BoxFuture<'static, Result<ProcessRef>>
        + Send
        + Sync,
>;

/// Named behavior factories available on this node
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: RwLock<HashMap<String, SpawnFn>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous entry
    pub fn register<B, F>(&self, name: &str, factory: F)
    where
        B: Behavior,
        F: Fn() -> B + Send + Sync + 'static,
    {
        let label = name.to_string();
        let spawn: SpawnFn = Arc::new(move |runtime: ActorRuntime, args: Payload, opts: SpawnOptions| {
            let behavior = factory();
            let label = label.clone();
            async move {
                let args = args.decode::<B::Args>()?;
                let opts = SpawnOptions {
                    label: opts.label.or(Some(label)),
                    ..opts
                };
                runtime.spawn_with(behavior, args, opts).await
            }
            .boxed()
        });

        if self.factories.write().insert(name.to_string(), spawn).is_some() {
            debug!(behavior = name, "Replaced behavior registration");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Spawn a process running the behavior registered as `name`
    pub async fn spawn(
        &self,
        runtime: &ActorRuntime,
        name: &str,
        args: Payload,
        opts: SpawnOptions,
    ) -> Result<ProcessRef> {
        let spawn = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ActorError::BehaviorNotFound {
                name: name.to_string(),
            })?;
        spawn(runtime.clone(), args, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::NodeId;

    struct Echo;

    #[async_trait]
    impl Behavior for Echo {
        type Args = String;
        type State = String;
        type Call = ();
        type Reply = String;
        type Cast = String;

        async fn init(&self, prefix: String) -> anyhow::Result<String> {
            Ok(prefix)
        }

        async fn handle_call(&self, _msg: (), state: &mut String) -> anyhow::Result<String> {
            Ok(state.clone())
        }

        async fn handle_cast(&self, msg: String, state: &mut String) -> anyhow::Result<()> {
            state.push_str(&msg);
            Ok(())
        }
    }

    fn runtime() -> ActorRuntime {
        ActorRuntime::new(NodeId::new("test", "127.0.0.1", 1))
    }

    #[tokio::test]
    async fn test_spawn_by_name_decodes_args() {
        let registry = BehaviorRegistry::new();
        registry.register("echo", || Echo);
        assert!(registry.contains("echo"));
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let runtime = runtime();
        let args = Payload::encode(&"hi".to_string()).unwrap();
        let pid = registry
            .spawn(&runtime, "echo", args, SpawnOptions::default())
            .await
            .unwrap();

        runtime.cast::<Echo>(&pid, " there".to_string()).unwrap();
        let reply = runtime.call::<Echo>(&pid, (), None).await.unwrap();
        assert_eq!(reply, "hi there");
        assert_eq!(runtime.process_info(&pid).unwrap().behavior, "echo");
    }

    #[tokio::test]
    async fn test_unknown_behavior_and_bad_args() {
        let registry = BehaviorRegistry::new();
        registry.register("echo", || Echo);
        let runtime = runtime();

        let err = registry
            .spawn(&runtime, "missing", Payload::encode(&()).unwrap(), SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::BehaviorNotFound { .. }));

        let err = registry
            .spawn(&runtime, "echo", Payload::encode(&42u32).unwrap(), SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ActorError::Codec { .. }));
        assert_eq!(runtime.process_count(), 0);
    }
}
