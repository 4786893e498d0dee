//! Outstanding remote requests
//!
//! Each request is completed exactly once: by its reply, by its timeout, or
//! by the loss of the node it was sent to. Whichever comes first removes the
//! entry; the others find nothing and are ignored.

use super::protocol::{RemoteFailure, ReplyBody};
use crate::error::{ActorError, Result};
use network::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

struct PendingCall {
    node: NodeId,
    timeout_ms: u64,
    reply: oneshot::Sender<Result<ReplyBody>>,
}

pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(
        &self,
        node: &NodeId,
        timeout_ms: u64,
    ) -> (u64, oneshot::Receiver<Result<ReplyBody>>) {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(
            call_id,
            PendingCall {
                node: node.clone(),
                timeout_ms,
                reply: tx,
            },
        );
        (call_id, rx)
    }

    /// Deliver a reply as received from the wire; false for unknown or
    /// already-completed ids
    pub(crate) fn complete_remote(
        &self,
        call_id: u64,
        result: std::result::Result<ReplyBody, RemoteFailure>,
    ) -> bool {
        match self.calls.lock().remove(&call_id) {
            Some(call) => {
                let result = result.map_err(|failure| failure.into_error(&call.node, call.timeout_ms));
                let _ = call.reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Forget a request; true if it was still outstanding
    pub(crate) fn expire(&self, call_id: u64) -> bool {
        self.calls.lock().remove(&call_id).is_some()
    }

    /// Fail every request sent to `node`
    pub(crate) fn fail_node(&self, node: &NodeId) -> usize {
        let mut calls = self.calls.lock();
        let ids: Vec<u64> = calls
            .iter()
            .filter(|(_, call)| &call.node == node)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(call) = calls.remove(id) {
                let _ = call.reply.send(Err(ActorError::node_down(node)));
            }
        }
        ids.len()
    }

    pub(crate) fn fail_all(&self, err: &ActorError) -> usize {
        let mut calls = self.calls.lock();
        let count = calls.len();
        for (_, call) in calls.drain() {
            let _ = call.reply.send(Err(err.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name, "127.0.0.1", 4370)
    }

    #[tokio::test]
    async fn test_reply_completes_once() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register(&node("b"), 100);

        assert!(pending.complete_remote(id, Ok(ReplyBody::Stopped)));
        assert!(!pending.complete_remote(id, Ok(ReplyBody::Stopped)));
        assert!(!pending.expire(id));
        assert_eq!(rx.await.unwrap().unwrap(), ReplyBody::Stopped);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_expired_call_ignores_late_reply() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register(&node("b"), 100);

        assert!(pending.expire(id));
        assert!(!pending.complete_remote(id, Ok(ReplyBody::Stopped)));
    }

    #[tokio::test]
    async fn test_node_loss_fails_only_that_nodes_calls() {
        let pending = PendingCalls::new();
        let (_, rx_b) = pending.register(&node("b"), 100);
        let (c_id, _rx_c) = pending.register(&node("c"), 100);

        assert_eq!(pending.fail_node(&node("b")), 1);
        assert!(matches!(rx_b.await.unwrap(), Err(ActorError::NodeDown { .. })));
        assert_eq!(pending.len(), 1);
        assert!(pending.complete_remote(c_id, Ok(ReplyBody::Stopped)));
    }

    #[tokio::test]
    async fn test_remote_failure_is_rebuilt_with_call_context() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register(&node("b"), 250);
        let failure = RemoteFailure {
            kind: "call_timeout".into(),
            detail: "proc-1".into(),
        };

        assert!(pending.complete_remote(id, Err(failure)));
        match rx.await.unwrap() {
            Err(ActorError::RemoteCallTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 250),
            other => panic!("unexpected {:?}", other),
        }
    }
}
