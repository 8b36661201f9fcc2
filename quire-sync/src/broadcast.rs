//! Fan-out of applied diffs to every session attached to a document.
//!
//! One tokio broadcast channel per document. Messages are encoded once
//! and shared as `Arc<Vec<u8>>`, so a send costs the same for 2 or 200
//! subscribers. Each session has its own receiver buffering up to
//! `capacity` frames; a session that falls further behind observes a
//! lag and is resynchronized with a full snapshot instead of stalling
//! the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::UserId;
use crate::error::SyncError;
use crate::protocol::{ProtocolError, ServerMessage};
use crate::SessionId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    /// Frames skipped by lagging receivers.
    pub frames_lagged: u64,
    pub subscribers: usize,
}

/// A pre-encoded [`ServerMessage`] plus its routing.
#[derive(Debug, Clone)]
pub enum Frame {
    /// For everyone but `origin`, which already has the change.
    Diff {
        origin: SessionId,
        bytes: Arc<Vec<u8>>,
    },
    Presence { bytes: Arc<Vec<u8>> },
    /// Only for `target`: send full state, preceded by `notice` if set.
    Resync {
        target: SessionId,
        notice: Option<Arc<Vec<u8>>>,
    },
}

impl Frame {
    pub fn is_for(&self, session: &SessionId) -> bool {
        match self {
            Frame::Diff { origin, .. } => origin != session,
            Frame::Presence { .. } => true,
            Frame::Resync { target, .. } => target == session,
        }
    }
}

#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Send a frame; returns the number of receivers. Lock-free.
    pub fn publish(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn diff(&self, origin: SessionId, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.publish(Frame::Diff { origin, bytes }))
    }

    pub fn presence(&self, participants: Vec<UserId>) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(ServerMessage::Presence { participants }.encode()?);
        Ok(self.publish(Frame::Presence { bytes }))
    }

    /// Ask the connection of `target` to resend full state, reporting
    /// `error` first if given.
    pub fn resync(
        &self,
        target: SessionId,
        error: Option<&SyncError>,
    ) -> Result<usize, ProtocolError> {
        let notice = error
            .map(|e| ServerMessage::error(e.kind(), e.to_string()).encode().map(Arc::new))
            .transpose()?;
        Ok(self.publish(Frame::Resync { target, notice }))
    }

    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
