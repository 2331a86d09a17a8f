use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for one delivery channel.
///
/// `extra` is channel specific: superseded samples on the live channel,
/// records recovered by batch flush on the outbox channel.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    extra: AtomicU64,
}

impl ChannelCounters {
    pub fn record_attempt(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extra(&self, n: u64) {
        self.extra.fetch_add(n, Ordering::Relaxed);
    }

    /// Reclassify `n` earlier failures as successes
    pub fn recover_failures(&self, n: u64) {
        let _ = self
            .failure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |f| {
                Some(f.saturating_sub(n))
            });
        self.success.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.failure.store(0, Ordering::Relaxed);
        self.extra.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        ChannelSnapshot {
            total,
            success,
            failure,
            extra: self.extra.load(Ordering::Relaxed),
            success_rate: success_rate(success, total),
        }
    }
}

fn success_rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (success as f64 / total as f64 * 100.0).min(100.0)
}

#[derive(Debug, Default)]
pub struct Stats {
    pub live: ChannelCounters,
    pub outbox: ChannelCounters,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.live.reset();
        self.outbox.reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub extra: u64,
    /// Percentage in [0, 100]
    pub success_rate: f64,
}

/// Read-only view handed to the host UI
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub live: ChannelSnapshot,
    pub outbox: ChannelSnapshot,
    pub queue_depth: usize,
    pub is_online: bool,
}
