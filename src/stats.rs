//! Process-lifetime counters exposed on the status page.
//!
//! One [`Stats`] instance exists per daemon context and is shared (via
//! `Arc`) by the HTTP dispatcher, the hook chains, and the action queue.
//! Tests instantiate their own, so nothing here is global.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Monotone counters plus the timestamp of the last action failure.
#[derive(Debug)]
pub struct Stats {
    requests_received: AtomicU64,
    requests_valid: AtomicU64,
    actions_scheduled: AtomicU64,
    actions_executed: AtomicU64,
    actions_failed: AtomicU64,
    /// Unix timestamp (seconds) of the last failure; 0 = never.
    last_failure: AtomicI64,
    started_at: DateTime<Utc>,
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_received: u64,
    pub requests_valid: u64,
    pub actions_scheduled: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl Stats {
    /// Creates a fresh counter set, stamping the start time.
    pub fn new() -> Self {
        Stats {
            requests_received: AtomicU64::new(0),
            requests_valid: AtomicU64::new(0),
            actions_scheduled: AtomicU64::new(0),
            actions_executed: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
            last_failure: AtomicI64::new(0),
            started_at: Utc::now(),
        }
    }

    /// A request arrived at a hook path.
    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A request passed authorization and delivered its body.
    pub fn request_valid(&self) {
        self.requests_valid.fetch_add(1, Ordering::Relaxed);
    }

    /// An action was appended to the queue.
    pub fn action_scheduled(&self) {
        self.actions_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// An action finished (successfully or not).
    pub fn action_executed(&self) {
        self.actions_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// An action failed; stamps the failure time.
    pub fn action_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
        self.last_failure
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Copies all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let last_failure = match self.last_failure.load(Ordering::Relaxed) {
            0 => None,
            secs => DateTime::<Utc>::from_timestamp(secs, 0),
        };
        StatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_valid: self.requests_valid.load(Ordering::Relaxed),
            actions_scheduled: self.actions_scheduled.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            last_failure,
            started_at: self.started_at,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}
