//! Domain statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::RetryReason;
use crate::page::LruClass;

/// Counters updated by the fault path and the swapper
#[derive(Debug, Default)]
pub struct DomainStats {
    /// Faults handled (including retries)
    pub faults: AtomicU64,
    /// New pages admitted to the local tier
    pub admissions: AtomicU64,
    /// Remote pages faulted back in
    pub promotions: AtomicU64,
    /// Faults on pages already local
    pub duplicate_faults: AtomicU64,
    /// Retries, indexed like [`RetryReason::ALL`]
    pub retries: [AtomicU64; 4],
    /// Wake requests sent to the swapper
    pub wakeups: AtomicU64,
    /// Pages removed through out-of-band invalidation
    pub removals: AtomicU64,

    pub cycles_started: AtomicU64,
    pub cycles_completed: AtomicU64,
    /// Cycles with demand that could not select a single victim
    pub cycles_abandoned: AtomicU64,
    /// Cycles that found all demand already in flight
    pub cycles_idle: AtomicU64,
    pub pages_selected: AtomicU64,
    pub pages_reclaimed: AtomicU64,
    pub pages_reactivated: AtomicU64,
    /// Batch entries dropped because their record changed under reclaim
    pub pages_pruned: AtomicU64,
    /// Selected victims that failed isolation
    pub spurious_victims: AtomicU64,
    /// Isolated victims, indexed like [`LruClass::ALL`]
    pub isolated: [AtomicU64; 4],
    /// Simulated remote access latency accrued by promotions (microseconds)
    pub remote_latency_us: AtomicU64,
    /// Time spent in reclaim cycles (microseconds)
    pub reclaim_time_us: AtomicU64,
}

impl DomainStats {
    pub fn record_retry(&self, reason: RetryReason) {
        let idx = RetryReason::ALL.iter().position(|r| *r == reason).unwrap_or(0);
        self.retries[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_isolated(&self, class: LruClass) {
        self.isolated[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DomainStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DomainStatsSnapshot {
            faults: load(&self.faults),
            admissions: load(&self.admissions),
            promotions: load(&self.promotions),
            duplicate_faults: load(&self.duplicate_faults),
            retries_null_entry: load(&self.retries[0]),
            retries_no_free_pages: load(&self.retries[1]),
            retries_exhausted: load(&self.retries[2]),
            retries_not_initialized: load(&self.retries[3]),
            wakeups: load(&self.wakeups),
            removals: load(&self.removals),
            cycles_started: load(&self.cycles_started),
            cycles_completed: load(&self.cycles_completed),
            cycles_abandoned: load(&self.cycles_abandoned),
            cycles_idle: load(&self.cycles_idle),
            pages_selected: load(&self.pages_selected),
            pages_reclaimed: load(&self.pages_reclaimed),
            pages_reactivated: load(&self.pages_reactivated),
            pages_pruned: load(&self.pages_pruned),
            spurious_victims: load(&self.spurious_victims),
            isolated_active_anon: load(&self.isolated[0]),
            isolated_inactive_anon: load(&self.isolated[1]),
            isolated_active_file: load(&self.isolated[2]),
            isolated_inactive_file: load(&self.isolated[3]),
            remote_latency_us: load(&self.remote_latency_us),
            reclaim_time_us: load(&self.reclaim_time_us),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainStatsSnapshot {
    pub faults: u64,
    pub admissions: u64,
    pub promotions: u64,
    pub duplicate_faults: u64,
    pub retries_null_entry: u64,
    pub retries_no_free_pages: u64,
    pub retries_exhausted: u64,
    pub retries_not_initialized: u64,
    pub wakeups: u64,
    pub removals: u64,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    pub cycles_idle: u64,
    pub pages_selected: u64,
    pub pages_reclaimed: u64,
    pub pages_reactivated: u64,
    pub pages_pruned: u64,
    pub spurious_victims: u64,
    pub isolated_active_anon: u64,
    pub isolated_inactive_anon: u64,
    pub isolated_active_file: u64,
    pub isolated_inactive_file: u64,
    pub remote_latency_us: u64,
    pub reclaim_time_us: u64,
}

impl DomainStatsSnapshot {
    pub fn total_retries(&self) -> u64 {
        self.retries_null_entry + self.retries_no_free_pages + self.retries_exhausted + self.retries_not_initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = DomainStats::default();
        stats.faults.fetch_add(3, Ordering::Relaxed);
        stats.record_retry(RetryReason::NoFreePages);
        stats.record_retry(RetryReason::NoFreePages);
        stats.record_retry(RetryReason::NullEntry);
        stats.record_isolated(LruClass::ActiveFile);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.faults, 3);
        assert_eq!(snapshot.retries_no_free_pages, 2);
        assert_eq!(snapshot.retries_null_entry, 1);
        assert_eq!(snapshot.total_retries(), 3);
        assert_eq!(snapshot.isolated_active_file, 1);
        assert_eq!(snapshot.isolated_active_anon, 0);
    }
}
