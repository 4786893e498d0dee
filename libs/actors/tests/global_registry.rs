//! Global name registry convergence across real nodes

mod common;

use actors::{ActorError, ExitReason, RegistryEvent, UnregisterReason};
use common::*;
use network::Subscription;
use std::time::Duration;
use tokio::time::{timeout, Instant};

async fn saw_conflict(events: &mut Subscription<RegistryEvent>, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while let Ok(Some(event)) = timeout(deadline.saturating_duration_since(Instant::now()), events.recv()).await {
        if matches!(event, RegistryEvent::ConflictResolved { .. }) {
            return true;
        }
    }
    false
}

#[test_log::test(tokio::test)]
async fn test_duplicate_registration_on_one_node_fails() {
    let node = start_node("solo", vec![]).await;
    let first = node.spawn(Counter, 0).await.unwrap();
    let second = node.spawn(Counter, 0).await.unwrap();

    node.register_name("svc", &first).unwrap();
    let err = node.register_name("svc", &second).unwrap_err();
    assert!(matches!(err, ActorError::GlobalNameConflict { .. }), "{:?}", err);
    let err = node.register_name("svc", &first).unwrap_err();
    assert!(matches!(err, ActorError::GlobalNameConflict { .. }), "{:?}", err);
    assert_eq!(node.whereis("svc"), Some(first));
    assert_eq!(node.registry().count(), 1);

    let err = node.registry().lookup("nobody").unwrap_err();
    assert!(matches!(err, ActorError::NameNotFound { .. }));
    assert!(matches!(
        node.unregister_name("nobody"),
        Err(ActorError::NameNotFound { .. })
    ));

    let dead = node.spawn(Counter, 0).await.unwrap();
    node.stop_process(&dead, ExitReason::Normal).await.unwrap();
    assert!(matches!(
        node.register_name("ghost", &dead),
        Err(ActorError::ProcessNotFound { .. })
    ));

    node.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_registration_propagates_and_resolves_remotely() {
    let nodes = start_cluster(3).await;
    let counter = nodes[0].spawn(Counter, 41).await.unwrap();
    nodes[0].register_name("answer", &counter).unwrap();

    let converged = wait_until(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.whereis("answer").as_ref() == Some(&counter))
    })
    .await;
    assert!(converged);

    let reply = nodes[2]
        .call_name::<Counter>("answer", CounterCall::Increment(1))
        .await
        .unwrap();
    assert_eq!(reply, 42);

    nodes[0].unregister_name("answer").unwrap();
    assert!(wait_until(Duration::from_secs(2), || nodes.iter().all(|n| n.whereis("answer").is_none())).await);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_concurrent_registrations_converge_to_one_winner() {
    let nodes = start_cluster(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let on_a = a.spawn(Counter, 0).await.unwrap();
    let on_b = b.spawn(Counter, 0).await.unwrap();
    let mut all_events: Vec<_> = nodes.iter().map(|n| n.registry().subscribe()).collect();

    // Neither broadcast can be applied between these two calls
    a.register_name("leader", &on_a).unwrap();
    b.register_name("leader", &on_b).unwrap();

    let converged = wait_until(Duration::from_secs(2), || {
        let (wa, wb, wc) = (a.whereis("leader"), b.whereis("leader"), c.whereis("leader"));
        wa.is_some() && wa == wb && wb == wc
    })
    .await;
    assert!(converged);
    let winner = a.whereis("leader").unwrap();
    assert!(winner == on_a || winner == on_b);

    for (node, events) in nodes.iter().zip(all_events.iter_mut()) {
        assert!(
            saw_conflict(events, Duration::from_secs(1)).await,
            "no ConflictResolved on {}",
            node.id()
        );
    }

    // Reported once per node, and anti-entropy must not undo the resolution
    tokio::time::sleep(Duration::from_millis(700)).await;
    for events in all_events.iter_mut() {
        assert!(!saw_conflict(events, Duration::from_millis(50)).await);
    }
    for node in &nodes {
        assert_eq!(node.whereis("leader"), Some(winner.clone()));
    }

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_exited_process_releases_its_names() {
    let nodes = start_cluster(2).await;
    let counter = nodes[0].spawn(Counter, 0).await.unwrap();
    nodes[0].register_name("short-lived", &counter).unwrap();
    assert!(wait_until(Duration::from_secs(2), || nodes[1].whereis("short-lived").is_some()).await);

    let _ = nodes[1]
        .call::<Counter>(&counter, CounterCall::Crash)
        .await;

    assert!(wait_until(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.whereis("short-lived").is_none())
    })
    .await);

    stop_all(&nodes).await;
}

#[test_log::test(tokio::test)]
async fn test_crashed_node_entries_are_purged_everywhere() {
    let nodes = start_cluster(3).await;
    let on_a = nodes[0].spawn(Counter, 0).await.unwrap();
    let on_b = nodes[1].spawn(Counter, 0).await.unwrap();
    nodes[0].register_name("a-svc", &on_a).unwrap();
    nodes[1].register_name("b-svc", &on_b).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        nodes.iter().all(|n| n.registry().count() == 2)
    })
    .await);

    nodes[1].kill();
    let survivors = [&nodes[0], &nodes[2]];
    assert!(wait_until(Duration::from_secs(3), || {
        survivors.iter().all(|n| n.whereis("b-svc").is_none())
    })
    .await);
    for node in survivors {
        assert_eq!(node.whereis("a-svc"), Some(on_a.clone()));
    }

    nodes[0].stop().await;
    nodes[2].stop().await;
}

#[test_log::test(tokio::test)]
async fn test_joining_node_receives_existing_registrations() {
    let a = start_node("a", vec![]).await;
    let mut expected = Vec::new();
    for i in 0..20 {
        let process = a.spawn(Counter, i).await.unwrap();
        let name = format!("worker-{:02}", i);
        a.register_name(&name, &process).unwrap();
        expected.push((name, process));
    }

    let joined_at = Instant::now();
    let c = start_node("c", vec![a.id().address().to_string()]).await;
    let synced = wait_until(Duration::from_secs(2), || c.registry().count() == 20).await;
    assert!(synced, "only {} entries after {:?}", c.registry().count(), joined_at.elapsed());
    for (name, process) in &expected {
        assert_eq!(c.whereis(name).as_ref(), Some(process));
    }

    a.stop().await;
    c.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_registrations_racing_snapshots_are_never_dropped() {
    let nodes = start_cluster(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let mut b_events = b.registry().subscribe();

    // Registrations keep landing while anti-entropy snapshots are in flight
    let mut expected = Vec::new();
    for i in 0..40 {
        let process = a.spawn(Counter, i).await.unwrap();
        let name = format!("racer-{:02}", i);
        a.register_name(&name, &process).unwrap();
        a.registry().sync();
        expected.push((name, process));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(wait_until(Duration::from_secs(2), || b.registry().count() == 40).await);
    for (name, process) in &expected {
        assert_eq!(b.whereis(name).as_ref(), Some(process));
    }
    while let Some(event) = b_events.try_recv() {
        assert!(
            !matches!(
                event,
                RegistryEvent::Unregistered {
                    reason: UnregisterReason::Stale,
                    ..
                }
            ),
            "{:?}",
            event
        );
    }

    stop_all(&nodes).await;
}
