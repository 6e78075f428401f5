//! Simulated Memory Domain
//!
//! A [`Domain`] is the tiered-memory state of one virtual machine: its page
//! index, free pool, victim selector and swap-out worker. Nothing is shared
//! between domains, so any number of simulated machines can run side by
//! side.
//!
//! ## Fault path
//!
//! [`Domain::on_fault`] runs synchronously on every guest access that misses
//! the fast tier:
//!
//! 1. Null entry reference → retry.
//! 2. No free page → wake the swapper, retry. Nothing is mutated.
//! 3. Under the index lock:
//!    - unknown entry → admit as `Local`, take a free page
//!    - `Remote` entry → promote to `Local`, take a free page
//!    - `Local` entry → nothing to do
//! 4. Free pages below the watermark → wake the swapper.
//!
//! The fault path never blocks on reclaim and never evicts inline.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DomainConfig;
use crate::error::{DomainError, DomainResult, FaultError, FaultResult, IndexError, IndexResult, InvariantViolation, RetryReason};
use crate::index::PageIndex;
use crate::page::{Gfn, MemTier, PageKey, PageRecord, Pfn};
use crate::pool::{FreePool, FreePoolState};
use crate::reclaim::Reclaimer;
use crate::selector::VictimSelector;
use crate::stats::{DomainStats, DomainStatsSnapshot};
use crate::swapper::{CycleReport, Swapper, SwapperSignal, WorkerState};

/// Cycle reports buffered before new ones are dropped
const REPORT_CHANNEL_DEPTH: usize = 1024;

/// Unique domain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(Uuid);

impl DomainId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, for log lines and thread names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for DomainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a successful fault did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultOutcome {
    /// First fault on this entry; tracked as local
    Admitted,
    /// Entry was remote and is local again
    Promoted,
    /// Entry already local; nothing changed
    AlreadyLocal,
}

// ============================================================================
// Domain Core (shared with the swapper thread)
// ============================================================================

pub(crate) struct DomainCore<K: PageKey> {
    pub(crate) label: String,
    pub(crate) config: DomainConfig,
    pub(crate) index: PageIndex<K>,
    pub(crate) pool: FreePool,
    pub(crate) selector: VictimSelector,
    pub(crate) stats: Arc<DomainStats>,
    pub(crate) signal: Arc<SwapperSignal>,
    reports: Sender<CycleReport>,
    halted: Mutex<Option<InvariantViolation>>,
}

impl<K: PageKey> DomainCore<K> {
    pub(crate) fn wake(&self) {
        self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
        self.signal.wake();
    }

    pub(crate) fn publish(&self, report: CycleReport) {
        let _ = self.reports.try_send(report);
    }

    /// Record a fatal violation. The first one wins.
    pub(crate) fn halt(&self, violation: InvariantViolation) {
        let mut halted = self.halted.lock();
        if halted.is_none() {
            log::error!("[Domain] {} halted: {}", self.label, violation);
            *halted = Some(violation);
        }
    }

    pub(crate) fn halt_reason(&self) -> Option<InvariantViolation> {
        self.halted.lock().clone()
    }
}

// ============================================================================
// Domain
// ============================================================================

/// Tiered memory state of one simulated virtual machine
pub struct Domain<K: PageKey> {
    id: DomainId,
    core: OnceLock<Arc<DomainCore<K>>>,
    init_lock: Mutex<()>,
    swapper: Mutex<Option<JoinHandle<()>>>,
    signal: Arc<SwapperSignal>,
    stats: Arc<DomainStats>,
    reports_tx: Sender<CycleReport>,
    reports_rx: Receiver<CycleReport>,
}

impl<K: PageKey> Domain<K> {
    /// Create an uninitialized domain. Faults are bounced with
    /// [`RetryReason::NotInitialized`] until [`init`](Self::init) runs.
    pub fn new() -> Self {
        let (reports_tx, reports_rx) = bounded(REPORT_CHANNEL_DEPTH);
        Self {
            id: DomainId::new(),
            core: OnceLock::new(),
            init_lock: Mutex::new(()),
            swapper: Mutex::new(None),
            signal: Arc::new(SwapperSignal::new(false)),
            stats: Arc::new(DomainStats::default()),
            reports_tx,
            reports_rx,
        }
    }

    /// Create and initialize in one step.
    pub fn with_config<R: Reclaimer<K>>(config: DomainConfig, reclaimer: R) -> DomainResult<Self> {
        let domain = Self::new();
        domain.init(config, reclaimer)?;
        Ok(domain)
    }

    /// Build the page index and free pool and start the swapper.
    ///
    /// Idempotent: on an initialized domain this does nothing, drops
    /// `reclaimer`, and returns `Ok(false)`.
    pub fn init<R: Reclaimer<K>>(&self, config: DomainConfig, reclaimer: R) -> DomainResult<bool> {
        let _guard = self.init_lock.lock();
        if self.core.get().is_some() {
            log::debug!("[Domain] {} already initialized", self.id.short());
            return Ok(false);
        }
        config.validate()?;

        let label = match &config.name {
            Some(name) => format!("{}({})", name, self.id.short()),
            None => self.id.short(),
        };
        let core = Arc::new(DomainCore {
            label,
            index: PageIndex::new(config.hash_bits),
            pool: FreePool::new(config.capacity_pages, config.watermark),
            selector: VictimSelector::new(config.selector_seed),
            stats: Arc::clone(&self.stats),
            signal: Arc::clone(&self.signal),
            reports: self.reports_tx.clone(),
            halted: Mutex::new(None),
            config,
        });

        let swapper = Swapper::new(Arc::clone(&core), Box::new(reclaimer));
        let handle = thread::Builder::new()
            .name(format!("tiermem-swap-{}", self.id.short()))
            .spawn(move || swapper.run())?;

        log::info!(
            "[Domain] {} initialized: local={}MB ({} pages), watermark={}, buckets={}",
            core.label,
            core.config.local_memory_bytes() / (1024 * 1024),
            core.config.capacity_pages,
            core.config.watermark,
            core.config.bucket_count()
        );

        *self.swapper.lock() = Some(handle);
        // Cannot fail: init_lock is held and the cell was empty.
        let _ = self.core.set(core);
        Ok(true)
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.core.get().is_some()
    }

    pub fn config(&self) -> Option<&DomainConfig> {
        self.core.get().map(|core| &core.config)
    }

    fn core(&self) -> DomainResult<&Arc<DomainCore<K>>> {
        self.core.get().ok_or(DomainError::NotInitialized)
    }

    // ------------------------------------------------------------------------
    // Fault path
    // ------------------------------------------------------------------------

    /// Handle a guest access that missed the fast tier.
    pub fn on_fault(&self, entry_ref: K, frame: Pfn, gfn: Gfn, level: u8) -> FaultResult<FaultOutcome> {
        let Some(core) = self.core.get() else {
            self.stats.record_retry(RetryReason::NotInitialized);
            return Err(FaultError::Retry(RetryReason::NotInitialized));
        };
        core.stats.faults.fetch_add(1, Ordering::Relaxed);

        if let Some(violation) = core.halt_reason() {
            return Err(FaultError::Fatal(violation));
        }

        if entry_ref.is_null() {
            log::warn!("[Fault] {} null entry reference, gfn={:#x}", core.label, gfn);
            return Err(retry(core, RetryReason::NullEntry));
        }

        if core.pool.observe_free() == 0 {
            core.wake();
            return Err(retry(core, RetryReason::NoFreePages));
        }

        let outcome = {
            let mut table = core.index.write();
            match table.get(&entry_ref).map(|r| r.tier) {
                None => {
                    if core.pool.reserve_for_admission().is_err() {
                        drop(table);
                        core.wake();
                        return Err(retry(core, RetryReason::Exhausted));
                    }
                    // Lookup and insert share the write lock, so this never
                    // sees a duplicate.
                    let record = PageRecord::new(entry_ref.clone(), frame, gfn, level, MemTier::Local);
                    if let Err(err) = table.insert(record) {
                        log::error!("[Fault] {} {}", core.label, err);
                        core.pool.release_on_reclaim(1)?;
                        return Ok(FaultOutcome::AlreadyLocal);
                    }
                    FaultOutcome::Admitted
                }
                Some(MemTier::Remote) => {
                    if core.pool.reserve_for_admission().is_err() {
                        drop(table);
                        core.wake();
                        return Err(retry(core, RetryReason::Exhausted));
                    }
                    let _ = table.set_tier(&entry_ref, MemTier::Local);
                    FaultOutcome::Promoted
                }
                Some(MemTier::Local) => FaultOutcome::AlreadyLocal,
            }
        };

        match outcome {
            FaultOutcome::Admitted => {
                core.stats.admissions.fetch_add(1, Ordering::Relaxed);
                log::trace!("[Fault] {} admitted {:?} gfn={:#x}", core.label, entry_ref, gfn);
            }
            FaultOutcome::Promoted => {
                core.stats.promotions.fetch_add(1, Ordering::Relaxed);
                core.stats
                    .remote_latency_us
                    .fetch_add(core.config.network_delay_us, Ordering::Relaxed);
                log::trace!("[Fault] {} promoted {:?} gfn={:#x}", core.label, entry_ref, gfn);
            }
            FaultOutcome::AlreadyLocal => {
                core.stats.duplicate_faults.fetch_add(1, Ordering::Relaxed);
            }
        }

        if core.pool.is_low() {
            core.wake();
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Direct index access
    // ------------------------------------------------------------------------

    pub fn lookup(&self, entry_ref: &K) -> Option<PageRecord<K>> {
        self.core.get()?.index.find(entry_ref)
    }

    /// Stop tracking `entry_ref` (guest unmap). A local page's slot goes
    /// back to the free pool.
    pub fn remove(&self, entry_ref: &K) -> IndexResult<PageRecord<K>> {
        let core = self
            .core
            .get()
            .ok_or_else(|| IndexError::NotFound(format!("{:?}", entry_ref)))?;

        let mut table = core.index.write();
        let record = table.remove(entry_ref)?;
        if record.is_local() {
            if let Err(violation) = core.pool.release_on_reclaim(1) {
                core.halt(violation);
            }
        }
        drop(table);

        core.stats.removals.fetch_add(1, Ordering::Relaxed);
        log::trace!("[Domain] {} removed {:?} ({:?})", core.label, entry_ref, record.tier);
        Ok(record)
    }

    /// Every tracked record, in bucket order.
    pub fn records(&self) -> Vec<PageRecord<K>> {
        self.core.get().map(|core| core.index.snapshot()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.core.get().map_or(0, |core| core.index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn local_count(&self) -> usize {
        self.core.get().map_or(0, |core| core.index.local_count())
    }

    pub fn remote_count(&self) -> usize {
        self.core.get().map_or(0, |core| core.index.remote_count())
    }

    // ------------------------------------------------------------------------
    // Pool, worker and statistics
    // ------------------------------------------------------------------------

    pub fn free_pool(&self) -> DomainResult<FreePoolState> {
        Ok(self.core()?.pool.snapshot())
    }

    pub fn stats(&self) -> DomainStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stream of reclaim cycle reports. Receivers share one queue.
    pub fn cycle_reports(&self) -> Receiver<CycleReport> {
        self.reports_rx.clone()
    }

    pub fn worker_state(&self) -> WorkerState {
        self.signal.state()
    }

    /// Kick the swapper to re-check pressure.
    pub fn wake(&self) -> DomainResult<()> {
        self.core()?.wake();
        Ok(())
    }

    /// Park the swapper between cycles. Wakes are remembered.
    /// May be called before [`init`](Self::init).
    pub fn pause(&self) {
        log::debug!("[Domain] {} swapper paused", self.id.short());
        self.signal.pause();
    }

    pub fn resume(&self) {
        log::debug!("[Domain] {} swapper resumed", self.id.short());
        self.signal.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.signal.is_paused()
    }

    pub fn halt_reason(&self) -> Option<InvariantViolation> {
        self.core.get().and_then(|core| core.halt_reason())
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason().is_some()
    }

    /// Stop and join the swapper. Pages still in flight stay in flight.
    pub fn shutdown(&self) {
        self.signal.shutdown();
        let handle = self.swapper.lock().take();
        if let Some(handle) = handle {
            log::debug!("[Domain] {} shutting down swapper", self.id.short());
            if handle.join().is_err() {
                log::error!("[Domain] {} swapper thread panicked", self.id.short());
            }
            let stats = self.stats.snapshot();
            log::info!(
                "[Domain] {} shutdown complete. Admitted: {}, Promoted: {}, Reclaimed: {}, Cycles: {}",
                self.id.short(),
                stats.admissions,
                stats.promotions,
                stats.pages_reclaimed,
                stats.cycles_completed
            );
        }
    }
}

impl<K: PageKey> Default for Domain<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PageKey> Drop for Domain<K> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn retry<K: PageKey>(core: &DomainCore<K>, reason: RetryReason) -> FaultError {
    core.stats.record_retry(reason);
    log::trace!("[Fault] {} retry: {}", core.label, reason);
    FaultError::Retry(reason)
}
