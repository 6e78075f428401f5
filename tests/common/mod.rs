//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tiermem::{CycleReport, LruClass, PageRecord, ReclaimBatch, ReclaimOutcome, Reclaimer};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Block until the swapper publishes its next cycle report.
pub fn next_report(reports: &Receiver<CycleReport>) -> CycleReport {
    reports
        .recv_timeout(TIMEOUT)
        .expect("swapper did not report a cycle in time")
}

/// Poll `cond` until it holds or the deadline passes.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Isolates only the first `limit` victims it is offered and reclaims
/// every page it is handed.
pub struct LimitedIsolation {
    pub limit: u32,
    pub isolated: u32,
}

impl LimitedIsolation {
    pub fn new(limit: u32) -> Self {
        Self { limit, isolated: 0 }
    }
}

impl Reclaimer<u64> for LimitedIsolation {
    fn isolate(&mut self, _record: &PageRecord<u64>) -> Option<LruClass> {
        if self.isolated >= self.limit {
            return None;
        }
        self.isolated += 1;
        Some(LruClass::InactiveFile)
    }

    fn reclaim(&mut self, batch: &mut ReclaimBatch<u64>, _demand: u32) -> ReclaimOutcome<u64> {
        let mut outcome = ReclaimOutcome::default();
        while batch.pop().is_some() {
            outcome.nr_reclaimed += 1;
        }
        outcome
    }
}

/// Claims to have reclaimed one page more than it was given.
pub struct OverReporting;

impl Reclaimer<u64> for OverReporting {
    fn reclaim(&mut self, batch: &mut ReclaimBatch<u64>, _demand: u32) -> ReclaimOutcome<u64> {
        let nr_reclaimed = batch.len() as u32 + 1;
        while batch.pop().is_some() {}
        ReclaimOutcome {
            nr_reclaimed,
            reactivated: Vec::new(),
        }
    }
}

/// Keeps every page resident.
pub struct ReactivateAll;

impl Reclaimer<u64> for ReactivateAll {
    fn reclaim(&mut self, batch: &mut ReclaimBatch<u64>, _demand: u32) -> ReclaimOutcome<u64> {
        let mut outcome = ReclaimOutcome::default();
        while let Some(page) = batch.pop() {
            outcome.reactivated.push(page);
        }
        outcome
    }
}

/// Blocks its first submission: the batch keys go out on `submitted` and
/// the call waits on `release` before reactivating everything. Later
/// submissions reactivate without blocking.
pub struct GatedReactivation {
    gate: Option<(Sender<Vec<u64>>, Receiver<()>)>,
}

impl GatedReactivation {
    pub fn new() -> (Self, Receiver<Vec<u64>>, Sender<()>) {
        let (submitted_tx, submitted_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        let gate = Some((submitted_tx, release_rx));
        (Self { gate }, submitted_rx, release_tx)
    }
}

impl Reclaimer<u64> for GatedReactivation {
    fn reclaim(&mut self, batch: &mut ReclaimBatch<u64>, demand: u32) -> ReclaimOutcome<u64> {
        if let Some((submitted, release)) = self.gate.take() {
            let keys = batch.iter().map(|page| page.entry_ref).collect();
            submitted.send(keys).expect("test dropped the submission receiver");
            release.recv_timeout(TIMEOUT).expect("test never released the batch");
        }
        ReactivateAll.reclaim(batch, demand)
    }
}

/// Panics on its first submission after raising `panicked`.
pub struct PanicOnReclaim {
    pub panicked: Arc<AtomicBool>,
}

impl Reclaimer<u64> for PanicOnReclaim {
    fn reclaim(&mut self, _batch: &mut ReclaimBatch<u64>, _demand: u32) -> ReclaimOutcome<u64> {
        self.panicked.store(true, Ordering::SeqCst);
        panic!("primitive failure");
    }
}
