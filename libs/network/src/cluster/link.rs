//! Per-link tasks
//!
//! A link to a peer runs two tasks. The reader decodes frames, refreshes the
//! liveness clock, hands data upwards and watches for heartbeat silence. The
//! writer drains the outbound queue and sends heartbeats. Liveness is judged
//! on the read side only, so a writer stuck on a full socket buffer cannot
//! hide a dead peer.

use super::{ClusterInner, DownReason, InboundFrame, NodeId};
use crate::protocol::Frame;
use crate::transports::{FrameReader, FrameWriter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Milliseconds since `epoch` when the last frame arrived
#[derive(Debug)]
pub(crate) struct LastSeen {
    epoch: Instant,
    millis: AtomicU64,
}

impl LastSeen {
    pub(crate) fn new(epoch: Instant) -> Self {
        let seen = Self {
            epoch,
            millis: AtomicU64::new(0),
        };
        seen.touch();
        seen
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.millis.store(now, Ordering::Relaxed);
    }

    pub(crate) fn silence(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.millis.load(Ordering::Relaxed)))
    }
}

/// Whole heartbeat intervals that passed without any frame from the peer
pub(crate) fn missed_heartbeats(silence: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    (silence.as_millis() / interval.as_millis()).min(u32::MAX as u128) as u32
}

pub(crate) struct LinkContext {
    pub inner: Weak<ClusterInner>,
    pub node: NodeId,
    pub link_id: u64,
    pub last_seen: Arc<LastSeen>,
}

impl LinkContext {
    fn lost(&self, reason: DownReason) {
        if let Some(inner) = self.inner.upgrade() {
            inner.link_lost(&self.node, self.link_id, reason);
        }
    }
}

pub(crate) async fn run_reader(
    ctx: Arc<LinkContext>,
    reader: FrameReader,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    heartbeat_interval: Duration,
    miss_threshold: u32,
) {
    // The read loop is only dropped once the link is already declared lost
    tokio::select! {
        _ = read_frames(&ctx, reader, inbound) => {}
        _ = watch_liveness(&ctx, heartbeat_interval, miss_threshold) => {}
    }
}

async fn watch_liveness(ctx: &LinkContext, heartbeat_interval: Duration, miss_threshold: u32) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let missed = missed_heartbeats(ctx.last_seen.silence(), heartbeat_interval);
        if missed >= miss_threshold {
            warn!(node = %ctx.node, missed, "Heartbeat threshold exceeded");
            ctx.lost(DownReason::HeartbeatTimeout);
            return;
        }
    }
}

async fn read_frames(
    ctx: &LinkContext,
    mut reader: FrameReader,
    inbound: mpsc::UnboundedSender<InboundFrame>,
) {
    loop {
        let bytes = match reader.read_frame().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                ctx.lost(DownReason::ConnectionClosed);
                return;
            }
            Err(e) => {
                debug!(node = %ctx.node, error = %e, "Link read failed");
                ctx.lost(DownReason::ConnectionClosed);
                return;
            }
        };
        ctx.last_seen.touch();

        let frame = match Frame::from_bytes(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %ctx.node, error = %e, "Undecodable frame, dropping link");
                ctx.lost(DownReason::ConnectionClosed);
                return;
            }
        };

        match frame {
            Frame::Data(payload) => {
                let _ = inbound.send(InboundFrame {
                    from: ctx.node.clone(),
                    payload,
                });
            }
            Frame::Heartbeat { sequence } => {
                trace!(node = %ctx.node, sequence, "Heartbeat");
            }
            Frame::Gossip { peers } => {
                if let Some(inner) = ctx.inner.upgrade() {
                    inner.on_gossip(&ctx.node, peers);
                }
            }
            Frame::Goodbye { reason } => {
                debug!(node = %ctx.node, %reason, "Peer said goodbye");
                ctx.lost(DownReason::Goodbye(reason));
                return;
            }
            other => {
                warn!(node = %ctx.node, kind = other.kind(), "Unexpected frame on established link");
            }
        }
    }
}

pub(crate) async fn run_writer(
    ctx: Arc<LinkContext>,
    mut writer: FrameWriter,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    greeting: Option<Frame>,
    heartbeat_interval: Duration,
) {
    if let Some(frame) = greeting {
        if let Err(e) = send(&mut writer, &frame).await {
            debug!(node = %ctx.node, error = %e, "Failed to send greeting");
            ctx.lost(DownReason::ConnectionClosed);
            return;
        }
    }

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let last = matches!(frame, Frame::Goodbye { .. });
                if let Err(e) = send(&mut writer, &frame).await {
                    debug!(node = %ctx.node, error = %e, "Link write failed");
                    ctx.lost(DownReason::ConnectionClosed);
                    return;
                }
                if last {
                    break;
                }
            }
            _ = ticker.tick() => {
                sequence += 1;
                if let Err(e) = send(&mut writer, &Frame::Heartbeat { sequence }).await {
                    debug!(node = %ctx.node, error = %e, "Heartbeat write failed");
                    ctx.lost(DownReason::ConnectionClosed);
                    return;
                }
            }
        }
    }

    writer.close().await;
}

async fn send(writer: &mut FrameWriter, frame: &Frame) -> crate::Result<()> {
    let bytes = frame.to_bytes()?;
    writer.send_frame(&bytes).await
}
