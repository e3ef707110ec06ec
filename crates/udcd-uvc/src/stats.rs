//! Streaming statistics.
//!
//! Counters are bumped from the streaming thread and the controller's
//! completion context, so every counter is a relaxed atomic.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Frames fully delivered
    pub frames_sent: u64,
    /// Frames abandoned after a conversion or transfer failure
    pub frames_dropped: u64,
    /// Payload transfers completed
    pub payload_transfers: u64,
    /// Frame bytes delivered, headers excluded
    pub payload_bytes: u64,
    /// Video-abort transitions from active to stopped
    pub aborts: u64,
}

/// Atomic streaming counters.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    payload_transfers: AtomicU64,
    payload_bytes: AtomicU64,
    aborts: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered frame of `bytes` split over `transfers` payloads.
    pub fn record_frame(&self, transfers: usize, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.payload_transfers
            .fetch_add(transfers as u64, Ordering::Relaxed);
        self.payload_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            payload_transfers: self.payload_transfers.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }
}
