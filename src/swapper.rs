//! Swap-Out Worker
//!
//! One background thread per domain keeps the local pool above its
//! watermark. The fault path never evicts inline; it only wakes this worker.
//!
//! ## State machine
//!
//! ```text
//!             wake (free < W)
//!   ┌──────┐ ─────────────────▶ ┌───────────┐  victims  ┌────────────┐
//!   │ Idle │                    │ Selecting │ ────────▶ │ Reclaiming │
//!   └──────┘ ◀──────────┐       └───────────┘           └────────────┘
//!      ▲      free >= W │             │ none                  │
//!      │                │             ▼                       ▼
//!      │           ┌────────────┐  ┌─────────┐          ┌────────────┐
//!      └───────────│ Accounting │  │ Backoff │◀─ none ──│ Accounting │
//!                  └────────────┘  └─────────┘  freed   └────────────┘
//!                                       │                     │ still low
//!                                       └──▶ Selecting ◀──────┘
//! ```
//!
//! ## Cycle
//!
//! 1. `target = (W - free) - under_reclaim`, capped by `max_batch_pages`.
//! 2. Select up to `target` victims; each is isolated through the
//!    [`Reclaimer`] and flipped to `Remote` under the index lock. Victims
//!    that fail isolation are skipped for the rest of the cycle.
//! 3. Prune leftovers whose record was removed or promoted meanwhile,
//!    splice the new victims in, and hand the whole batch to the primitive.
//! 4. Roll reactivated pages back to `Local` (no free-page credit), then
//!    settle `under_reclaim` and credit `nr_reclaimed` free pages.
//!
//! A cycle with demand that cannot assemble a single victim is abandoned
//! without touching accounting. Cycles that free nothing back off
//! exponentially between `backoff_min_us` and `backoff_max_us`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::domain::DomainCore;
use crate::error::InvariantViolation;
use crate::page::{LruClass, MemTier, PageKey};
use crate::pool::{ReclaimDemand, Settlement};
use crate::reclaim::{PageHandle, ReclaimBatch, Reclaimer};

// ============================================================================
// Worker State
// ============================================================================

/// Observable swapper state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Domain not initialized, no worker yet
    NotStarted,
    /// Blocked until woken
    Idle,
    /// Assembling a batch of victims
    Selecting,
    /// Batch handed to the reclamation primitive
    Reclaiming,
    /// Applying the primitive's result
    Accounting,
    /// Last cycle made no progress; sleeping before the next one
    Backoff,
    /// Parked by [`pause`](crate::Domain::pause)
    Paused,
    /// Stopped after an invariant violation
    Halted,
    /// Shut down
    Stopped,
}

impl WorkerState {
    const ORDER: [WorkerState; 9] = [
        WorkerState::NotStarted,
        WorkerState::Idle,
        WorkerState::Selecting,
        WorkerState::Reclaiming,
        WorkerState::Accounting,
        WorkerState::Backoff,
        WorkerState::Paused,
        WorkerState::Halted,
        WorkerState::Stopped,
    ];

    fn as_u8(self) -> u8 {
        Self::ORDER.iter().position(|s| *s == self).unwrap_or(0) as u8
    }

    fn from_u8(raw: u8) -> Self {
        Self::ORDER.get(raw as usize).copied().unwrap_or(WorkerState::NotStarted)
    }

    /// Worker is between cycles (not touching the index or the batch)
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            WorkerState::Idle | WorkerState::Backoff | WorkerState::Paused | WorkerState::Halted | WorkerState::Stopped
        )
    }
}

// ============================================================================
// Wake / Pause Signalling
// ============================================================================

#[derive(Debug, Default)]
struct SignalFlags {
    wake_pending: bool,
    paused: bool,
    shutdown: bool,
}

/// Wake, pause and shutdown requests from the rest of the domain
pub(crate) struct SwapperSignal {
    flags: Mutex<SignalFlags>,
    cv: Condvar,
    state: AtomicU8,
}

impl SwapperSignal {
    pub(crate) fn new(paused: bool) -> Self {
        Self {
            flags: Mutex::new(SignalFlags {
                paused,
                ..SignalFlags::default()
            }),
            cv: Condvar::new(),
            state: AtomicU8::new(WorkerState::NotStarted.as_u8()),
        }
    }

    /// Request a reclaim check. Waking a running worker is a no-op.
    pub(crate) fn wake(&self) {
        self.flags.lock().wake_pending = true;
        self.cv.notify_all();
    }

    pub(crate) fn pause(&self) {
        self.flags.lock().paused = true;
    }

    pub(crate) fn resume(&self) {
        self.flags.lock().paused = false;
        self.cv.notify_all();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.flags.lock().paused
    }

    pub(crate) fn shutdown(&self) {
        self.flags.lock().shutdown = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.flags.lock().shutdown
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Park while paused. Returns `false` on shutdown.
    fn wait_runnable(&self) -> bool {
        let mut flags = self.flags.lock();
        while flags.paused && !flags.shutdown {
            self.set_state(WorkerState::Paused);
            self.cv.wait(&mut flags);
        }
        !flags.shutdown
    }

    /// Block until woken and consume the wake. Returns `false` on shutdown.
    fn wait_for_wake(&self) -> bool {
        let mut flags = self.flags.lock();
        while !flags.wake_pending && !flags.shutdown {
            self.cv.wait(&mut flags);
        }
        flags.wake_pending = false;
        !flags.shutdown
    }

    /// Sleep for `dur`, ignoring wakes. Returns `false` on shutdown.
    fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut flags = self.flags.lock();
        while !flags.shutdown {
            if self.cv.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        !flags.shutdown
    }
}

// ============================================================================
// Cycle Reports
// ============================================================================

/// How a reclaim cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleOutcome {
    /// At least one free page came back
    Progress,
    /// A batch was submitted but no free page came back
    NoProgress,
    /// Demand was positive but no victim could be selected
    Abandoned,
}

/// Summary of one reclaim cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    /// Free pages when the cycle started
    pub free_pages: u32,
    /// `W - free_pages` when the cycle started
    pub shortfall: u32,
    /// In-flight pages when the cycle started
    pub under_reclaim: u32,
    /// Victims wanted this cycle
    pub target: u32,
    /// Victims isolated and flipped to remote
    pub selected: u32,
    /// Selected victims that failed isolation
    pub spurious: u32,
    /// Leftovers dropped from the batch before submission
    pub pruned: u32,
    /// Pages handed to the primitive
    pub submitted: u32,
    pub reclaimed: u32,
    pub reactivated: u32,
    /// Pages left in the batch after submission
    pub retained: u32,
    /// Isolated victims per LRU class, indexed like [`LruClass::ALL`]
    pub lru: [u32; 4],
    pub duration_us: u64,
}

impl CycleReport {
    fn new(cycle: u64, demand: &ReclaimDemand, target: u32) -> Self {
        Self {
            cycle,
            outcome: CycleOutcome::Abandoned,
            free_pages: demand.free_pages,
            shortfall: demand.shortfall,
            under_reclaim: demand.under_reclaim,
            target,
            selected: 0,
            spurious: 0,
            pruned: 0,
            submitted: 0,
            reclaimed: 0,
            reactivated: 0,
            retained: 0,
            lru: [0; 4],
            duration_us: 0,
        }
    }

    pub fn lru_count(&self, class: LruClass) -> u32 {
        self.lru[class.index()]
    }
}

// ============================================================================
// Swapper
// ============================================================================

/// Background swap-out worker of one domain
pub(crate) struct Swapper<K: PageKey> {
    core: Arc<DomainCore<K>>,
    reclaimer: Box<dyn Reclaimer<K>>,
    batch: ReclaimBatch<K>,
    backoff: Duration,
    cycles: u64,
}

impl<K: PageKey> Swapper<K> {
    pub(crate) fn new(core: Arc<DomainCore<K>>, reclaimer: Box<dyn Reclaimer<K>>) -> Self {
        let backoff = Duration::from_micros(core.config.backoff_min_us);
        Self {
            core,
            reclaimer,
            batch: ReclaimBatch::new(),
            backoff,
            cycles: 0,
        }
    }

    pub(crate) fn run(mut self) {
        let core = Arc::clone(&self.core);
        let signal = &core.signal;
        log::debug!("[Swapper] {} worker started", core.label);

        loop {
            if !signal.wait_runnable() {
                break;
            }

            let demand = core.pool.reclaim_demand();
            if !demand.is_pressured() {
                signal.set_state(WorkerState::Idle);
                if !signal.wait_for_wake() {
                    break;
                }
                continue;
            }

            match self.run_cycle(demand) {
                Ok(CycleOutcome::Progress) => {
                    self.backoff = Duration::from_micros(core.config.backoff_min_us);
                }
                Ok(_) => {
                    signal.set_state(WorkerState::Backoff);
                    log::trace!("[Swapper] {} backing off {:?}", core.label, self.backoff);
                    if !signal.sleep(self.backoff) {
                        break;
                    }
                    let max = Duration::from_micros(core.config.backoff_max_us);
                    self.backoff = (self.backoff * 2).min(max);
                }
                Err(violation) => {
                    core.halt(violation);
                    signal.set_state(WorkerState::Halted);
                    log::debug!("[Swapper] {} worker halted", core.label);
                    return;
                }
            }
        }

        signal.set_state(WorkerState::Stopped);
        log::debug!(
            "[Swapper] {} worker stopped, {} page(s) left in flight",
            core.label,
            self.batch.len()
        );
    }

    /// One Selecting → Reclaiming → Accounting pass.
    fn run_cycle(&mut self, demand: ReclaimDemand) -> Result<CycleOutcome, InvariantViolation> {
        let core = Arc::clone(&self.core);
        let started = Instant::now();
        self.cycles += 1;
        let cycle = self.cycles;
        core.stats.cycles_started.fetch_add(1, Ordering::Relaxed);

        let target = match core.config.max_batch_pages {
            Some(max) => demand.target.min(max),
            None => demand.target,
        };
        let mut report = CycleReport::new(cycle, &demand, target);

        log::debug!(
            "[Swapper] {} cycle {}: free={}, shortfall={}, under_reclaim={}, target={}",
            core.label,
            cycle,
            demand.free_pages,
            demand.shortfall,
            demand.under_reclaim,
            target
        );

        // Selecting
        let victims = if target > 0 {
            core.signal.set_state(WorkerState::Selecting);
            self.select_victims(target, &mut report)
        } else {
            core.stats.cycles_idle.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        };

        if target > 0 && victims.is_empty() {
            log::debug!("[Swapper] {} cycle {}: no victim found, abandoning", core.label, cycle);
            core.stats.cycles_abandoned.fetch_add(1, Ordering::Relaxed);
            report.outcome = CycleOutcome::Abandoned;
            report.duration_us = started.elapsed().as_micros() as u64;
            core.publish(report);
            return Ok(CycleOutcome::Abandoned);
        }

        // Reclaiming
        core.signal.set_state(WorkerState::Reclaiming);
        report.pruned = self.prune_batch()?;
        let added = victims.len() as u32;
        self.batch.splice_front(victims);
        let submitted = self.batch.len() as u32;
        report.submitted = submitted;

        let outcome = self.reclaimer.reclaim(&mut self.batch, demand.shortfall);
        let reclaimed = outcome.nr_reclaimed;
        let reactivated = outcome.nr_reactivated();
        if reclaimed as u64 + reactivated as u64 > submitted as u64 {
            return Err(InvariantViolation::PrimitiveDisagreement {
                reclaimed,
                reactivated,
                batch: submitted,
            });
        }
        log::debug!(
            "[Swapper] {} cycle {}: submitted={}, reclaimed={}, reactivated={}",
            core.label,
            cycle,
            submitted,
            reclaimed,
            reactivated
        );

        // Accounting
        core.signal.set_state(WorkerState::Accounting);
        let returned = self.roll_back(&outcome.reactivated);
        let state = core.pool.settle(Settlement {
            added,
            reclaimed,
            reactivated,
        })?;
        if returned > 0 {
            core.pool.release_on_reclaim(returned)?;
        }

        let elapsed = started.elapsed();
        core.stats.cycles_completed.fetch_add(1, Ordering::Relaxed);
        core.stats.pages_reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        core.stats.pages_reactivated.fetch_add(reactivated as u64, Ordering::Relaxed);
        core.stats.reclaim_time_us.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        report.reclaimed = reclaimed;
        report.reactivated = reactivated;
        report.retained = self.batch.len() as u32;
        report.outcome = if reclaimed > 0 || returned > 0 || report.pruned > 0 {
            CycleOutcome::Progress
        } else {
            CycleOutcome::NoProgress
        };
        report.duration_us = elapsed.as_micros() as u64;

        log::debug!(
            "[Swapper] {} cycle {} complete: free={}, under_reclaim={}, time={:?}",
            core.label,
            cycle,
            state.free_pages,
            state.under_reclaim,
            elapsed
        );

        let outcome = report.outcome;
        core.publish(report);
        Ok(outcome)
    }

    /// Pick up to `target` victims, flipping each to `Remote`.
    fn select_victims(&mut self, target: u32, report: &mut CycleReport) -> Vec<PageHandle<K>> {
        let core = Arc::clone(&self.core);
        let mut victims = Vec::with_capacity(target as usize);
        let mut skipped: HashSet<K> = HashSet::new();
        let max_attempts = core.config.max_selection_attempts;

        while victims.len() < target as usize {
            if core.signal.is_shutdown() {
                break;
            }

            let mut table = core.index.write();
            let record = match core.selector.select_in(&table, &skipped) {
                Some(record) => record.clone(),
                None => break,
            };

            let class = match self.reclaimer.isolate(&record) {
                Some(class) => class,
                None => {
                    log::trace!("[Swapper] victim {:?} not isolatable, retrying", record.entry_ref);
                    core.stats.spurious_victims.fetch_add(1, Ordering::Relaxed);
                    report.spurious += 1;
                    skipped.insert(record.entry_ref);
                    if report.spurious >= max_attempts {
                        log::debug!("[Swapper] {} gave up after {} spurious victims", core.label, report.spurious);
                        break;
                    }
                    continue;
                }
            };

            if table.set_tier(&record.entry_ref, MemTier::Remote).is_err() {
                skipped.insert(record.entry_ref);
                continue;
            }
            drop(table);

            core.stats.pages_selected.fetch_add(1, Ordering::Relaxed);
            core.stats.record_isolated(class);
            report.selected += 1;
            report.lru[class.index()] += 1;
            victims.push(PageHandle::new(&record, class));
        }

        victims
    }

    /// Drop leftovers whose record was removed or promoted back to local
    /// since they were queued. Their slots go back to the free pool.
    fn prune_batch(&mut self) -> Result<u32, InvariantViolation> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let pruned = {
            let table = self.core.index.read();
            self.batch
                .extract(|page| table.get(&page.entry_ref).map_or(true, |r| r.tier != MemTier::Remote))
                .len() as u32
        };
        if pruned > 0 {
            log::debug!("[Swapper] {} pruned {} stale batch page(s)", self.core.label, pruned);
            self.core.pool.abandon_in_flight(pruned)?;
            self.core.stats.pages_pruned.fetch_add(pruned as u64, Ordering::Relaxed);
        }
        Ok(pruned)
    }

    /// Revert reactivated pages to `Local`. Returns how many reactivated
    /// pages had no remote record left to revert; their slots must be
    /// returned to the pool.
    fn roll_back(&self, reactivated: &[PageHandle<K>]) -> u32 {
        if reactivated.is_empty() {
            return 0;
        }
        let mut table = self.core.index.write();
        let mut returned = 0;
        for page in reactivated {
            match table.get(&page.entry_ref).map(|r| r.tier) {
                Some(MemTier::Remote) => {
                    let _ = table.set_tier(&page.entry_ref, MemTier::Local);
                }
                _ => returned += 1,
            }
        }
        returned
    }
}
