//! Cross-node call, cast, spawn and monitor over loopback TCP

mod common;

use actors::{ActorError, ExitReason, ProcessDown};
use common::*;
use network::NodeId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

async fn recv_down(rx: &mut mpsc::UnboundedReceiver<ProcessDown>, within: Duration) -> ProcessDown {
    timeout(within, rx.recv())
        .await
        .expect("no process_down in time")
        .expect("monitor channel closed")
}

#[test_log::test(tokio::test)]
async fn test_remote_call_and_cast_keep_mailbox_order() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let counter = b.spawn(Counter, 0).await.unwrap();
    a.cast::<Counter>(&counter, 5).unwrap();
    assert_eq!(a.call::<Counter>(&counter, CounterCall::Get).await.unwrap(), 5);

    for _ in 0..100 {
        a.cast::<Counter>(&counter, 1).unwrap();
    }
    assert_eq!(a.call::<Counter>(&counter, CounterCall::Get).await.unwrap(), 105);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_concurrent_remote_increments_are_all_applied() {
    let nodes = start_cluster(2).await;
    let counter = nodes[1].spawn(Counter, 0).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let node = nodes[0].clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            node.call::<Counter>(&counter, CounterCall::Increment(1)).await
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    let total = nodes[0]
        .call::<Counter>(&counter, CounterCall::Get)
        .await
        .unwrap();
    assert_eq!(total, succeeded);
    assert_eq!(succeeded, 100);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_large_payload_round_trips_unchanged() {
    let nodes = start_cluster(2).await;
    let echo = nodes[1].spawn(Echo, ()).await.unwrap();

    let data: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    let reply = nodes[0].call::<Echo>(&echo, data.clone()).await.unwrap();
    assert_eq!(reply, data);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_remote_spawn_by_behavior_name() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let counter = a.spawn_remote(b.id(), "counter", &10i64).await.unwrap();
    assert_eq!(&counter.node, b.id());
    assert!(b.runtime().is_alive(&counter));
    assert_eq!(a.call::<Counter>(&counter, CounterCall::Increment(1)).await.unwrap(), 11);

    let err = a.spawn_remote(b.id(), "missing", &()).await.unwrap_err();
    assert!(matches!(err, ActorError::BehaviorNotFound { .. }), "{:?}", err);

    let err = a.spawn_remote(b.id(), "failing_init", &()).await.unwrap_err();
    assert!(matches!(err, ActorError::Init { .. }), "{:?}", err);

    let ghost = NodeId::new("ghost", "127.0.0.1", 1);
    let err = a.spawn_remote(&ghost, "counter", &0i64).await.unwrap_err();
    assert!(matches!(err, ActorError::NodeDown { .. }), "{:?}", err);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_remote_process_crashes_after_n_calls() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let crasher = a.spawn_remote(b.id(), "crash_after", &3u32).await.unwrap();
    assert_eq!(a.call::<CrashAfter>(&crasher, ()).await.unwrap(), 2);
    assert_eq!(a.call::<CrashAfter>(&crasher, ()).await.unwrap(), 1);

    let err = a.call::<CrashAfter>(&crasher, ()).await.unwrap_err();
    assert!(matches!(err, ActorError::ProcessExited { .. }), "{:?}", err);
    assert!(wait_until(Duration::from_secs(1), || !b.runtime().is_alive(&crasher)).await);

    let err = a.call::<CrashAfter>(&crasher, ()).await.unwrap_err();
    assert!(matches!(err, ActorError::ProcessNotFound { .. }), "{:?}", err);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_remote_call_timeout_discards_late_reply() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let counter = b.spawn(Counter, 7).await.unwrap();

    let err = a
        .call_timeout::<Counter>(&counter, CounterCall::Sleep(500), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ActorError::RemoteCallTimeout { .. }), "{:?}", err);

    // The process is still busy sleeping; the next call waits its turn
    assert_eq!(a.call::<Counter>(&counter, CounterCall::Get).await.unwrap(), 7);
    assert!(wait_until(Duration::from_secs(1), || a.messaging().pending_requests() == 0).await);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_node_loss_fails_pending_calls_immediately() {
    let nodes = start_cluster(2).await;
    let (a, b) = (nodes[0].clone(), nodes[1].clone());
    let counter = b.spawn(Counter, 0).await.unwrap();

    let caller = {
        let a = a.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            a.call_timeout::<Counter>(&counter, CounterCall::Sleep(10_000), Duration::from_secs(20))
                .await
        })
    };
    assert!(wait_until(Duration::from_secs(1), || a.messaging().pending_requests() == 1).await);

    let killed_at = Instant::now();
    b.kill();
    let result = timeout(Duration::from_secs(3), caller).await.unwrap().unwrap();
    assert!(matches!(result, Err(ActorError::NodeDown { .. })), "{:?}", result);
    assert!(killed_at.elapsed() < Duration::from_secs(3));
    assert_eq!(a.messaging().pending_requests(), 0);

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_remote_monitor_fires_once_on_stop() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let counter = b.spawn(Counter, 0).await.unwrap();

    // Holding a sender keeps the channel open, so silence means no second notice
    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = a.monitor_channel(&counter, tx.clone());
    // Give the monitor request a head start over the stop
    assert!(wait_until(Duration::from_secs(1), || b.messaging().monitor_count() == 1).await);

    b.stop_process(&counter, ExitReason::Shutdown).await.unwrap();
    let down = recv_down(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(down.monitor, monitor);
    assert_eq!(down.process, counter);
    assert_eq!(down.reason, ExitReason::Shutdown);

    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    assert!(!a.demonitor(&monitor));
    assert_eq!(a.messaging().monitor_count(), 0);
    drop(tx);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_monitoring_a_dead_process_reports_noproc() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let counter = b.spawn(Counter, 0).await.unwrap();
    b.stop_process(&counter, ExitReason::Normal).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.monitor_channel(&counter, tx.clone());
    let down = recv_down(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(down.reason, ExitReason::NoProc);

    let local = a.spawn(Counter, 0).await.unwrap();
    a.stop_process(&local, ExitReason::Normal).await.unwrap();
    a.monitor_channel(&local, tx);
    let down = recv_down(&mut rx, Duration::from_secs(1)).await;
    assert_eq!(down.reason, ExitReason::NoProc);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_demonitor_suppresses_notification() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let counter = b.spawn(Counter, 0).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = a.monitor_channel(&counter, tx.clone());
    assert!(a.demonitor(&monitor));
    assert!(!a.demonitor(&monitor));

    b.stop_process(&counter, ExitReason::Shutdown).await.unwrap();
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    assert_eq!(a.messaging().monitor_count(), 0);
    drop(tx);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_monitor_reports_node_down() {
    let nodes = start_cluster(2).await;
    let (a, b) = (nodes[0].clone(), nodes[1].clone());
    let counter = b.spawn(Counter, 0).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.monitor_channel(&counter, tx.clone());
    assert!(wait_until(Duration::from_secs(1), || b.messaging().monitor_count() == 1).await);

    let b_id = b.id().clone();
    b.kill();
    let down = recv_down(&mut rx, Duration::from_secs(3)).await;
    assert_eq!(down.reason, ExitReason::NodeDown(b_id));
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    drop(tx);

    a.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_process_watcher_receives_process_down_info() {
    use actors::{Behavior, SystemMessage};
    use async_trait::async_trait;

    /// Counts the process_down notifications it receives
    struct Watcher;

    #[async_trait]
    impl Behavior for Watcher {
        type Args = ();
        type State = u32;
        type Call = ();
        type Reply = u32;
        type Cast = ();

        async fn init(&self, _: ()) -> anyhow::Result<u32> {
            Ok(0)
        }

        async fn handle_call(&self, _: (), seen: &mut u32) -> anyhow::Result<u32> {
            Ok(*seen)
        }

        async fn handle_cast(&self, _: (), _: &mut u32) -> anyhow::Result<()> {
            Ok(())
        }

        async fn handle_info(&self, msg: SystemMessage, seen: &mut u32) -> anyhow::Result<()> {
            match msg {
                SystemMessage::ProcessDown(_) => *seen += 1,
            }
            Ok(())
        }
    }

    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let watcher = a.spawn(Watcher, ()).await.unwrap();
    let counter = b.spawn(Counter, 0).await.unwrap();

    a.monitor(&watcher, &counter).unwrap();
    assert!(wait_until(Duration::from_secs(1), || b.messaging().monitor_count() == 1).await);
    b.stop_process(&counter, ExitReason::Shutdown).await.unwrap();

    let watcher_ref = watcher.clone();
    let seen = eventually(Duration::from_secs(2), || {
        let a = a.clone();
        let watcher = watcher_ref.clone();
        async move { a.call::<Watcher>(&watcher, ()).await.unwrap_or(0) == 1 }
    })
    .await;
    assert!(seen);

    let err = a.monitor(&counter, &watcher).unwrap_err();
    assert!(matches!(err, ActorError::InvalidOperation { .. }));

    stop_all(&nodes).await;
}
