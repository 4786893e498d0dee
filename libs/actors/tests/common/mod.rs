//! Shared behaviors and cluster helpers for the multi-node tests
#![allow(dead_code)]

use actors::{Behavior, BehaviorRegistry, Node};
use anyhow::bail;
use async_trait::async_trait;
use node_config::NodeConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub struct Counter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CounterCall {
    Get,
    Increment(i64),
    Sleep(u64),
    Crash,
}

#[async_trait]
impl Behavior for Counter {
    type Args = i64;
    type State = i64;
    type Call = CounterCall;
    type Reply = i64;
    type Cast = i64;

    async fn init(&self, start: i64) -> anyhow::Result<i64> {
        Ok(start)
    }

    async fn handle_call(&self, msg: CounterCall, count: &mut i64) -> anyhow::Result<i64> {
        match msg {
            CounterCall::Get => {}
            CounterCall::Increment(by) => *count += by,
            CounterCall::Sleep(ms) => sleep(Duration::from_millis(ms)).await,
            CounterCall::Crash => bail!("crash requested"),
        }
        Ok(*count)
    }

    async fn handle_cast(&self, by: i64, count: &mut i64) -> anyhow::Result<()> {
        *count += by;
        Ok(())
    }
}

/// Echoes binary payloads back unchanged
pub struct Echo;

#[async_trait]
impl Behavior for Echo {
    type Args = ();
    type State = ();
    type Call = Vec<u8>;
    type Reply = Vec<u8>;
    type Cast = ();

    async fn init(&self, _: ()) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_call(&self, msg: Vec<u8>, _: &mut ()) -> anyhow::Result<Vec<u8>> {
        Ok(msg)
    }

    async fn handle_cast(&self, _: (), _: &mut ()) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Answers with the calls it has left and fails once none remain
pub struct CrashAfter;

#[async_trait]
impl Behavior for CrashAfter {
    type Args = u32;
    type State = u32;
    type Call = ();
    type Reply = u32;
    type Cast = ();

    async fn init(&self, calls: u32) -> anyhow::Result<u32> {
        Ok(calls)
    }

    async fn handle_call(&self, _: (), remaining: &mut u32) -> anyhow::Result<u32> {
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            bail!("out of calls");
        }
        Ok(*remaining)
    }

    async fn handle_cast(&self, _: (), _: &mut u32) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct FailingInit;

#[async_trait]
impl Behavior for FailingInit {
    type Args = ();
    type State = ();
    type Call = ();
    type Reply = ();
    type Cast = ();

    async fn init(&self, _: ()) -> anyhow::Result<()> {
        bail!("refusing to start")
    }

    async fn handle_call(&self, _: (), _: &mut ()) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_cast(&self, _: (), _: &mut ()) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn behaviors() -> Arc<BehaviorRegistry> {
    let registry = BehaviorRegistry::new();
    registry.register("counter", || Counter);
    registry.register("echo", || Echo);
    registry.register("crash_after", || CrashAfter);
    registry.register("failing_init", || FailingInit);
    Arc::new(registry)
}

pub fn config(name: &str, seeds: Vec<String>) -> NodeConfig {
    NodeConfig::new(name)
        .with_secret("cookie")
        .with_seeds(seeds)
        .with_heartbeat(100, 3)
        .with_gossip_interval(100)
        .with_registry_sync_interval(500)
}

pub async fn start_node(name: &str, seeds: Vec<String>) -> Node {
    Node::start(config(name, seeds), behaviors()).await.unwrap()
}

/// Start `size` nodes seeded from the first and wait for a full mesh
pub async fn start_cluster(size: usize) -> Vec<Node> {
    let first = start_node("n0", vec![]).await;
    let seed = first.id().address().to_string();
    let mut nodes = vec![first];
    for i in 1..size {
        nodes.push(start_node(&format!("n{}", i), vec![seed.clone()]).await);
    }
    let meshed = wait_until(Duration::from_secs(5), || {
        nodes.iter().all(|n| n.connected_nodes().len() == size - 1)
    })
    .await;
    assert!(meshed, "cluster of {} did not form a full mesh", size);
    nodes
}

pub async fn wait_until<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check().await
}

pub async fn stop_all(nodes: &[Node]) {
    for node in nodes {
        node.stop().await;
    }
}
