//! Reclamation primitive interface
//!
//! The swapper never pages anything out itself. It isolates victims through
//! a [`Reclaimer`], collects them in a [`ReclaimBatch`] and hands the batch
//! over in one call. The primitive removes the pages it evicted from the
//! batch, returns the pages it decided to keep resident, and may leave the
//! rest in the batch for a later cycle. Input order is not preserved.

use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DomainConfig;
use crate::page::{Gfn, LruClass, PageKey, PageRecord, Pfn};

/// A victim page handed to the reclamation primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHandle<K> {
    pub entry_ref: K,
    pub frame: Pfn,
    pub guest_frame_number: Gfn,
    /// LRU list the page was isolated from
    pub lru: LruClass,
}

impl<K: PageKey> PageHandle<K> {
    pub fn new(record: &PageRecord<K>, lru: LruClass) -> Self {
        Self {
            entry_ref: record.entry_ref.clone(),
            frame: record.frame,
            guest_frame_number: record.guest_frame_number,
            lru,
        }
    }
}

/// Pages committed to reclaim, owned by the swapper between submissions
#[derive(Debug, Clone)]
pub struct ReclaimBatch<K> {
    pages: Vec<PageHandle<K>>,
}

impl<K: PageKey> ReclaimBatch<K> {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn push(&mut self, page: PageHandle<K>) {
        self.pages.push(page);
    }

    /// Splice `other` in front of the pages already queued.
    pub fn splice_front(&mut self, other: Vec<PageHandle<K>>) {
        self.pages.splice(0..0, other);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageHandle<K>> {
        self.pages.iter()
    }

    /// Remove and return every page matching `pred`.
    pub fn extract<F: FnMut(&PageHandle<K>) -> bool>(&mut self, mut pred: F) -> Vec<PageHandle<K>> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.pages.len());
        for page in self.pages.drain(..) {
            if pred(&page) {
                taken.push(page);
            } else {
                kept.push(page);
            }
        }
        self.pages = kept;
        taken
    }

    pub fn pop(&mut self) -> Option<PageHandle<K>> {
        self.pages.pop()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pages.iter().any(|p| &p.entry_ref == key)
    }
}

impl<K: PageKey> Default for ReclaimBatch<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the primitive did with a submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimOutcome<K> {
    /// Pages confirmed evicted (already removed from the batch)
    pub nr_reclaimed: u32,
    /// Pages kept resident (already removed from the batch)
    pub reactivated: Vec<PageHandle<K>>,
}

impl<K> ReclaimOutcome<K> {
    pub fn nr_reactivated(&self) -> u32 {
        self.reactivated.len() as u32
    }
}

impl<K> Default for ReclaimOutcome<K> {
    fn default() -> Self {
        Self {
            nr_reclaimed: 0,
            reactivated: Vec::new(),
        }
    }
}

/// External page reclamation primitive
pub trait Reclaimer<K: PageKey>: Send + 'static {
    /// Detach a selected victim from whatever list currently holds it.
    /// `None` means the page is not reclaimable right now (for example
    /// another subsystem holds it); the swapper will pick another victim.
    fn isolate(&mut self, _record: &PageRecord<K>) -> Option<LruClass> {
        Some(LruClass::InactiveAnon)
    }

    /// Reclaim pages from `batch`. `demand` is the number of pages the
    /// swapper would like freed; it is advisory.
    fn reclaim(&mut self, batch: &mut ReclaimBatch<K>, demand: u32) -> ReclaimOutcome<K>;
}

/// Simulated reclamation with tunable success, reactivation and isolation
/// failure rates.
pub struct SimulatedReclaimer {
    reclaim_ratio: f64,
    reactivate_ratio: f64,
    isolate_failure_ratio: f64,
    anon_ratio: f64,
    per_page_delay: Duration,
    stop_at_demand: bool,
    rng: StdRng,
}

impl SimulatedReclaimer {
    /// A primitive that evicts every page it is given.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            reclaim_ratio: 1.0,
            reactivate_ratio: 0.0,
            isolate_failure_ratio: 0.0,
            anon_ratio: 1.0,
            per_page_delay: Duration::ZERO,
            stop_at_demand: false,
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }

    pub fn from_config(config: &DomainConfig) -> Self {
        Self::new(config.selector_seed.map(|s| s.wrapping_add(1)))
            .with_delay(Duration::from_micros(config.network_delay_us))
    }

    /// Fractions of each batch reclaimed and reactivated; the remainder is
    /// left in the batch.
    pub fn with_ratios(mut self, reclaim: f64, reactivate: f64) -> Self {
        self.reclaim_ratio = reclaim.clamp(0.0, 1.0);
        self.reactivate_ratio = reactivate.clamp(0.0, 1.0 - self.reclaim_ratio);
        self
    }

    pub fn with_isolate_failures(mut self, ratio: f64) -> Self {
        self.isolate_failure_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Fraction of isolated pages classified as anonymous (rest are file)
    pub fn with_anon_ratio(mut self, ratio: f64) -> Self {
        self.anon_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, per_page: Duration) -> Self {
        self.per_page_delay = per_page;
        self
    }

    pub fn stop_at_demand(mut self, stop: bool) -> Self {
        self.stop_at_demand = stop;
        self
    }
}

impl<K: PageKey> Reclaimer<K> for SimulatedReclaimer {
    fn isolate(&mut self, _record: &PageRecord<K>) -> Option<LruClass> {
        if self.rng.gen::<f64>() < self.isolate_failure_ratio {
            return None;
        }
        let anon = self.rng.gen::<f64>() < self.anon_ratio;
        let active = self.rng.gen::<bool>();
        Some(match (anon, active) {
            (true, true) => LruClass::ActiveAnon,
            (true, false) => LruClass::InactiveAnon,
            (false, true) => LruClass::ActiveFile,
            (false, false) => LruClass::InactiveFile,
        })
    }

    fn reclaim(&mut self, batch: &mut ReclaimBatch<K>, demand: u32) -> ReclaimOutcome<K> {
        let mut nr_reclaimed = 0u32;
        let mut reactivated = Vec::new();
        let mut retained = Vec::new();

        while let Some(page) = batch.pop() {
            if self.stop_at_demand && nr_reclaimed >= demand {
                retained.push(page);
                continue;
            }
            let roll = self.rng.gen::<f64>();
            if roll < self.reclaim_ratio {
                nr_reclaimed += 1;
            } else if roll < self.reclaim_ratio + self.reactivate_ratio {
                reactivated.push(page);
            } else {
                retained.push(page);
            }
        }
        for page in retained {
            batch.push(page);
        }

        if !self.per_page_delay.is_zero() && nr_reclaimed > 0 {
            thread::sleep(self.per_page_delay * nr_reclaimed);
        }

        ReclaimOutcome { nr_reclaimed, reactivated }
    }
}
