use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Connection and launch counters, updated lock-free from session tasks.
#[derive(Debug, Default)]
pub struct ControlStats {
    accepted: AtomicU64,
    bound: AtomicU64,
    rejected: AtomicU64,
    handshake_lost: AtomicU64,
    sessions_released: AtomicU64,
    launch_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub bound: u64,
    pub rejected: u64,
    /// Connections that timed out or dropped before identifying.
    pub handshake_lost: u64,
    /// Bound sessions that have since ended.
    pub sessions_released: u64,
    pub launch_failures: u64,
}

impl ControlStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bound(&self) {
        self.bound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_lost(&self) {
        self.handshake_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_released(&self) {
        self.sessions_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launch_failure(&self) {
        self.launch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            bound: self.bound.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            handshake_lost: self.handshake_lost.load(Ordering::Relaxed),
            sessions_released: self.sessions_released.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
        }
    }
}
