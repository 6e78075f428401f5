//! Victim Selector
//!
//! Picks a local page to evict. Selection is random rather
//! than LRU/LFU: a random start key is drawn, buckets are scanned forward
//! from the bucket that key hashes to, and if nothing eligible lies between
//! there and the end of the table a single full pass from bucket 0 follows.
//! Worst case is one and a bit passes over the table.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::index::{IndexTable, PageIndex};
use crate::page::{PageKey, PageRecord};

/// Random-start, wrap-around victim selector
pub struct VictimSelector {
    rng: Mutex<StdRng>,
}

impl VictimSelector {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng: Mutex::new(rng) }
    }

    fn start_key(&self) -> u64 {
        self.rng.lock().gen()
    }

    /// Pick one eligible record from `index`.
    pub fn select_one<K: PageKey>(&self, index: &PageIndex<K>) -> Option<PageRecord<K>> {
        let start_key = self.start_key();
        let table = index.read();
        scan_from(&table, start_key, &HashSet::new()).cloned()
    }

    /// Same as [`select_one`](Self::select_one), on an already locked table,
    /// skipping keys in `exclude`.
    pub fn select_in<'a, K: PageKey>(
        &self,
        table: &'a IndexTable<K>,
        exclude: &HashSet<K>,
    ) -> Option<&'a PageRecord<K>> {
        scan_from(table, self.start_key(), exclude)
    }
}

impl Default for VictimSelector {
    fn default() -> Self {
        Self::new(None)
    }
}

fn scan_from<'a, K: PageKey>(
    table: &'a IndexTable<K>,
    start_key: u64,
    exclude: &HashSet<K>,
) -> Option<&'a PageRecord<K>> {
    if table.local_count() == 0 {
        return None;
    }

    let eligible = |r: &&PageRecord<K>| r.is_evictable() && !exclude.contains(&r.entry_ref);
    let start = table.bucket_of_raw(start_key);
    log::trace!("[Selector] start_key={:#x}, bucket={}/{}", start_key, start, table.bucket_count());

    let forward = (start..table.bucket_count()).find_map(|bkt| table.bucket(bkt).iter().find(eligible));
    if forward.is_some() {
        return forward;
    }

    // Circle back.
    (0..table.bucket_count()).find_map(|bkt| table.bucket(bkt).iter().find(eligible))
}
