//! Free-Pool Accountant
//!
//! Tracks how many local pages are free and how many are committed to a
//! reclaim batch but not yet confirmed evicted. Every read-modify-write runs
//! under one lock; callers never act on a stale snapshot when mutating.

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::InvariantViolation;

/// Point-in-time view of the free pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreePoolState {
    pub total_pages: u32,
    pub free_pages: u32,
    pub under_reclaim: u32,
}

impl FreePoolState {
    pub fn used_pages(&self) -> u32 {
        self.total_pages - self.free_pages
    }
}

/// Returned by [`FreePool::reserve_for_admission`] when no page is free
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("free pool exhausted")]
pub struct Exhausted;

/// Settlement of one reclaim submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settlement {
    /// Pages newly added to the batch this cycle
    pub added: u32,
    /// Pages the primitive confirmed evicted
    pub reclaimed: u32,
    /// Pages the primitive kept resident
    pub reactivated: u32,
}

/// Free pool of one domain
pub struct FreePool {
    state: Mutex<FreePoolState>,
    watermark: u32,
}

impl FreePool {
    /// Create a pool with every page free.
    pub fn new(total_pages: u32, watermark: u32) -> Self {
        Self {
            state: Mutex::new(FreePoolState {
                total_pages,
                free_pages: total_pages,
                under_reclaim: 0,
            }),
            watermark,
        }
    }

    pub fn watermark(&self) -> u32 {
        self.watermark
    }

    pub fn total(&self) -> u32 {
        self.state.lock().total_pages
    }

    pub fn observe_free(&self) -> u32 {
        self.state.lock().free_pages
    }

    pub fn under_reclaim(&self) -> u32 {
        self.state.lock().under_reclaim
    }

    pub fn snapshot(&self) -> FreePoolState {
        *self.state.lock()
    }

    pub fn is_low(&self) -> bool {
        self.observe_free() < self.watermark
    }

    /// Take one free page for a newly admitted or promoted page.
    pub fn reserve_for_admission(&self) -> Result<(), Exhausted> {
        let mut state = self.state.lock();
        if state.free_pages == 0 {
            return Err(Exhausted);
        }
        state.free_pages -= 1;
        Ok(())
    }

    /// Credit `n` confirmed-free pages back to the pool.
    pub fn release_on_reclaim(&self, n: u32) -> Result<(), InvariantViolation> {
        let mut state = self.state.lock();
        credit(&mut state, n)
    }

    /// Pages the swapper should select now: the shortfall below the
    /// watermark minus what is already in flight. Zero when not low.
    pub fn reclaim_demand(&self) -> ReclaimDemand {
        let state = self.state.lock();
        let shortfall = self.watermark.saturating_sub(state.free_pages);
        ReclaimDemand {
            free_pages: state.free_pages,
            shortfall,
            under_reclaim: state.under_reclaim,
            target: shortfall.saturating_sub(state.under_reclaim),
        }
    }

    /// Apply the result of a reclaim submission:
    /// `under_reclaim += added - reclaimed - reactivated`, `free += reclaimed`.
    pub fn settle(&self, settlement: Settlement) -> Result<FreePoolState, InvariantViolation> {
        let mut state = self.state.lock();
        let in_flight = state.under_reclaim as u64 + settlement.added as u64;
        let settled = settlement.reclaimed as u64 + settlement.reactivated as u64;
        if settled > in_flight {
            return Err(InvariantViolation::UnderReclaimUnderflow {
                under_reclaim: state.under_reclaim.saturating_add(settlement.added),
                settled: settled.min(u32::MAX as u64) as u32,
            });
        }
        let remaining = (in_flight - settled) as u32;
        credit(&mut state, settlement.reclaimed)?;
        state.under_reclaim = remaining;
        Ok(*state)
    }

    /// Drop `n` pages from the in-flight count and return their slots.
    /// Used for batch entries that left the batch without being reclaimed
    /// because their record was removed or promoted meanwhile.
    pub fn abandon_in_flight(&self, n: u32) -> Result<(), InvariantViolation> {
        let mut state = self.state.lock();
        if n > state.under_reclaim {
            return Err(InvariantViolation::UnderReclaimUnderflow {
                under_reclaim: state.under_reclaim,
                settled: n,
            });
        }
        credit(&mut state, n)?;
        state.under_reclaim -= n;
        Ok(())
    }
}

fn credit(state: &mut FreePoolState, n: u32) -> Result<(), InvariantViolation> {
    match state.free_pages.checked_add(n) {
        Some(free) if free <= state.total_pages => {
            state.free_pages = free;
            Ok(())
        }
        _ => Err(InvariantViolation::FreeOverflow {
            free: state.free_pages,
            credit: n,
            total: state.total_pages,
        }),
    }
}

/// Snapshot of reclaim pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimDemand {
    pub free_pages: u32,
    /// `watermark - free_pages`, saturating
    pub shortfall: u32,
    pub under_reclaim: u32,
    /// `shortfall - under_reclaim`, saturating
    pub target: u32,
}

impl ReclaimDemand {
    pub fn is_pressured(&self) -> bool {
        self.shortfall > 0
    }
}
