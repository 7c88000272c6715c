//! Runtime counters
//!
//! Shared by every endpoint and the scheduler of one node. Counters are
//! relaxed atomics; readers take a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Token transport counters
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    tokens_sent: AtomicU64,
    tokens_acked: AtomicU64,
    tokens_nacked: AtomicU64,
    tokens_retransmitted: AtomicU64,
    tokens_received: AtomicU64,
    duplicates: AtomicU64,
    local_transfers: AtomicU64,
}

impl EndpointMetrics {
    #[inline]
    pub fn record_sent(&self) {
        self.tokens_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ack(&self) {
        self.tokens_acked.fetch_add(1, Ordering::Relaxed);
    }

    /// A NACK rolled back `rolled_back` tentative reads
    #[inline]
    pub fn record_nack(&self, rolled_back: u64) {
        self.tokens_nacked.fetch_add(1, Ordering::Relaxed);
        self.tokens_retransmitted.fetch_add(rolled_back, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(&self) {
        self.tokens_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_local_transfer(&self) {
        self.local_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            tokens_sent: self.tokens_sent.load(Ordering::Relaxed),
            tokens_acked: self.tokens_acked.load(Ordering::Relaxed),
            tokens_nacked: self.tokens_nacked.load(Ordering::Relaxed),
            tokens_retransmitted: self.tokens_retransmitted.load(Ordering::Relaxed),
            tokens_received: self.tokens_received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            local_transfers: self.local_transfers.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub tokens_sent: u64,
    pub tokens_acked: u64,
    pub tokens_nacked: u64,
    pub tokens_retransmitted: u64,
    pub tokens_received: u64,
    pub duplicates: u64,
    pub local_transfers: u64,
}

/// Scheduler counters
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    strategy_passes: AtomicU64,
    actor_firings: AtomicU64,
    communicate_progress: AtomicU64,
    watchdog_fires: AtomicU64,
    maintenance_runs: AtomicU64,
}

impl SchedulerMetrics {
    #[inline]
    pub fn record_pass(&self) {
        self.strategy_passes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_firing(&self) {
        self.actor_firings.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_communicate(&self) {
        self.communicate_progress.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_watchdog(&self) {
        self.watchdog_fires.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_maintenance(&self) {
        self.maintenance_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            strategy_passes: self.strategy_passes.load(Ordering::Relaxed),
            actor_firings: self.actor_firings.load(Ordering::Relaxed),
            communicate_progress: self.communicate_progress.load(Ordering::Relaxed),
            watchdog_fires: self.watchdog_fires.load(Ordering::Relaxed),
            maintenance_runs: self.maintenance_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub strategy_passes: u64,
    pub actor_firings: u64,
    pub communicate_progress: u64,
    pub watchdog_fires: u64,
    pub maintenance_runs: u64,
}
