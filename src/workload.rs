//! Synthetic guest workload
//!
//! Drives a [`Domain`] the way a set of vCPUs would: every access to a page
//! that is not local raises a fault, and faults bounced with a retry are
//! re-driven after a short pause. Accesses are uniform over a fixed working
//! set, so a working set larger than the local pool keeps the swapper busy.

use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::domain::{Domain, FaultOutcome};
use crate::error::FaultError;
use crate::page::{MemTier, PAGE_SHIFT};
use crate::pool::FreePoolState;
use crate::stats::DomainStatsSnapshot;

/// How a vCPU re-drives a fault the domain asked it to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Attempts after the first before the access is dropped
    pub max_retries: u32,
    /// Pause between attempts
    #[serde(with = "duration_us")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1000,
            backoff: Duration::from_micros(50),
        }
    }
}

mod duration_us {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }
}

/// Synthetic access pattern
#[derive(Debug, Clone, Serialize)]
pub struct Workload {
    pub vcpus: usize,
    pub accesses_per_vcpu: u64,
    /// Distinct guest pages touched
    pub working_set: u64,
    /// Fraction of accesses that unmap the page instead of touching it
    pub unmap_ratio: f64,
    /// Fraction of pages mapped as huge pages (never evicted)
    pub huge_ratio: f64,
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            vcpus: 1,
            accesses_per_vcpu: 10_000,
            working_set: 4096,
            unmap_ratio: 0.0,
            huge_ratio: 0.0,
            seed: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one workload run
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub vcpus: usize,
    pub accesses: u64,
    pub admitted: u64,
    pub promoted: u64,
    pub already_local: u64,
    pub unmapped: u64,
    /// Retried attempts across all accesses
    pub retries: u64,
    /// Accesses dropped after exhausting the retry policy
    pub gave_up: u64,
    /// Set when the domain halted during the run
    pub fatal: Option<String>,
    pub elapsed_ms: u64,
    pub pool: Option<FreePoolState>,
    pub local_pages: usize,
    pub remote_pages: usize,
    pub stats: DomainStatsSnapshot,
}

#[derive(Debug, Default)]
struct VcpuTally {
    accesses: u64,
    admitted: u64,
    promoted: u64,
    already_local: u64,
    unmapped: u64,
    retries: u64,
    gave_up: u64,
    fatal: Option<String>,
}

impl VcpuTally {
    fn merge(&mut self, other: VcpuTally) {
        self.accesses += other.accesses;
        self.admitted += other.admitted;
        self.promoted += other.promoted;
        self.already_local += other.already_local;
        self.unmapped += other.unmapped;
        self.retries += other.retries;
        self.gave_up += other.gave_up;
        if self.fatal.is_none() {
            self.fatal = other.fatal;
        }
    }
}

impl Workload {
    pub fn new(vcpus: usize, accesses_per_vcpu: u64, working_set: u64) -> Self {
        Self {
            vcpus: vcpus.max(1),
            accesses_per_vcpu,
            working_set: working_set.max(1),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_unmap_ratio(mut self, ratio: f64) -> Self {
        self.unmap_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_huge_ratio(mut self, ratio: f64) -> Self {
        self.huge_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Page-table entry reference of guest page `gfn`. Never null.
    pub fn entry_ref(gfn: u64) -> u64 {
        (gfn + 1) << 3
    }

    /// Run every vCPU to completion against `domain`.
    pub fn run(&self, domain: &Domain<u64>) -> WorkloadReport {
        let started = Instant::now();
        log::info!(
            "[Workload] {} vCPU(s) x {} accesses over {} pages",
            self.vcpus,
            self.accesses_per_vcpu,
            self.working_set
        );

        let mut total = VcpuTally::default();
        thread::scope(|scope| {
            let handles: Vec<_> = (0..self.vcpus)
                .map(|vcpu| scope.spawn(move || self.run_vcpu(vcpu, domain)))
                .collect();
            for (vcpu, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(tally) => total.merge(tally),
                    Err(_) => log::error!("[Workload] vCPU {} panicked", vcpu),
                }
            }
        });

        let elapsed = started.elapsed();
        log::info!(
            "[Workload] done in {:?}: admitted={}, promoted={}, retries={}, gave_up={}",
            elapsed,
            total.admitted,
            total.promoted,
            total.retries,
            total.gave_up
        );

        WorkloadReport {
            vcpus: self.vcpus,
            accesses: total.accesses,
            admitted: total.admitted,
            promoted: total.promoted,
            already_local: total.already_local,
            unmapped: total.unmapped,
            retries: total.retries,
            gave_up: total.gave_up,
            fatal: total.fatal,
            elapsed_ms: elapsed.as_millis() as u64,
            pool: domain.free_pool().ok(),
            local_pages: domain.local_count(),
            remote_pages: domain.remote_count(),
            stats: domain.stats(),
        }
    }

    fn run_vcpu(&self, vcpu: usize, domain: &Domain<u64>) -> VcpuTally {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(vcpu as u64)),
            None => StdRng::from_entropy(),
        };
        let mut tally = VcpuTally::default();

        for _ in 0..self.accesses_per_vcpu {
            tally.accesses += 1;
            let gfn = rng.gen_range(0..self.working_set);
            let entry_ref = Self::entry_ref(gfn);

            if self.unmap_ratio > 0.0 && rng.gen::<f64>() < self.unmap_ratio {
                if domain.remove(&entry_ref).is_ok() {
                    tally.unmapped += 1;
                }
                continue;
            }

            // Accesses to a local page do not fault.
            if domain.lookup(&entry_ref).map(|r| r.tier) == Some(MemTier::Local) {
                tally.already_local += 1;
                continue;
            }

            let level = if rng.gen::<f64>() < self.huge_ratio { 2 } else { 1 };
            let frame = gfn + (1 << (32 - PAGE_SHIFT));
            match self.drive_fault(domain, entry_ref, frame, gfn, level, &mut tally) {
                Ok(Some(FaultOutcome::Admitted)) => tally.admitted += 1,
                Ok(Some(FaultOutcome::Promoted)) => tally.promoted += 1,
                Ok(Some(FaultOutcome::AlreadyLocal)) => tally.already_local += 1,
                Ok(None) => tally.gave_up += 1,
                Err(violation) => {
                    log::error!("[Workload] vCPU {} stopping: {}", vcpu, violation);
                    tally.fatal = Some(violation);
                    break;
                }
            }
        }
        tally
    }

    /// Re-drive one fault per the retry policy. `Ok(None)` when the policy
    /// ran out; `Err` when the domain halted.
    fn drive_fault(
        &self,
        domain: &Domain<u64>,
        entry_ref: u64,
        frame: u64,
        gfn: u64,
        level: u8,
        tally: &mut VcpuTally,
    ) -> Result<Option<FaultOutcome>, String> {
        let mut attempt = 0;
        loop {
            match domain.on_fault(entry_ref, frame, gfn, level) {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(FaultError::Fatal(violation)) => return Err(violation.to_string()),
                Err(FaultError::Retry(reason)) => {
                    if attempt >= self.retry.max_retries {
                        log::debug!("[Workload] gfn={:#x} dropped after {} retries ({})", gfn, attempt, reason);
                        return Ok(None);
                    }
                    attempt += 1;
                    tally.retries += 1;
                    thread::sleep(self.retry.backoff);
                }
            }
        }
    }
}
