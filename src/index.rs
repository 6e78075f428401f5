//! Page Index
//!
//! Hash-bucketed set of tracked guest pages, keyed by the page-table slot
//! they belong to. One coarse [`RwLock`] guards the whole table: lookups on
//! the fault path and tier changes by the swapper are serialized per record
//! by that lock, so a promotion can never interleave with an eviction of the
//! same entry.
//!
//! ```text
//! ┌──────────────── IndexTable (1 << hash_bits buckets) ────────────────┐
//! │ [0] ─▶ rec ─▶ rec                                                    │
//! │ [1] ─▶ (empty)                                                       │
//! │ [2] ─▶ rec                                                           │
//! │ ...                                                                  │
//! │ [n-1] ─▶ rec ─▶ rec ─▶ rec                                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{IndexError, IndexResult};
use crate::page::{Gfn, MemTier, PageKey, PageRecord, Pfn};

const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

/// Bucket table behind the index lock
pub struct IndexTable<K> {
    buckets: Vec<Vec<PageRecord<K>>>,
    hash_bits: u8,
    hasher: BuildHasherDefault<DefaultHasher>,
    len: usize,
    local: usize,
}

impl<K: PageKey> IndexTable<K> {
    fn new(hash_bits: u8) -> Self {
        let count = 1usize << hash_bits;
        Self {
            buckets: (0..count).map(|_| Vec::new()).collect(),
            hash_bits,
            hasher: BuildHasherDefault::default(),
            len: 0,
            local: 0,
        }
    }

    /// Bucket a raw 64-bit value falls into (multiplicative hash, top bits).
    pub fn bucket_of_raw(&self, raw: u64) -> usize {
        (raw.wrapping_mul(GOLDEN_RATIO_64) >> (64 - self.hash_bits as u32)) as usize
    }

    pub fn bucket_of(&self, key: &K) -> usize {
        self.bucket_of_raw(self.hasher.hash_one(key))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, idx: usize) -> &[PageRecord<K>] {
        &self.buckets[idx]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn local_count(&self) -> usize {
        self.local
    }

    pub fn remote_count(&self) -> usize {
        self.len - self.local
    }

    pub fn get(&self, key: &K) -> Option<&PageRecord<K>> {
        self.buckets[self.bucket_of(key)].iter().find(|r| &r.entry_ref == key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, record: PageRecord<K>) -> IndexResult<()> {
        let bkt = self.bucket_of(&record.entry_ref);
        if self.buckets[bkt].iter().any(|r| r.entry_ref == record.entry_ref) {
            return Err(IndexError::Duplicate(format!("{:?}", record.entry_ref)));
        }
        if record.is_local() {
            self.local += 1;
        }
        self.len += 1;
        self.buckets[bkt].push(record);
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> IndexResult<PageRecord<K>> {
        let bkt = self.bucket_of(key);
        let pos = self.buckets[bkt]
            .iter()
            .position(|r| &r.entry_ref == key)
            .ok_or_else(|| IndexError::NotFound(format!("{:?}", key)))?;
        let record = self.buckets[bkt].remove(pos);
        if record.is_local() {
            self.local -= 1;
        }
        self.len -= 1;
        Ok(record)
    }

    /// Change the tier of `key`, returning the previous tier.
    pub fn set_tier(&mut self, key: &K, tier: MemTier) -> IndexResult<MemTier> {
        let bkt = self.bucket_of(key);
        let record = self.buckets[bkt]
            .iter_mut()
            .find(|r| &r.entry_ref == key)
            .ok_or_else(|| IndexError::NotFound(format!("{:?}", key)))?;
        let previous = record.tier;
        record.tier = tier;
        match (previous, tier) {
            (MemTier::Remote, MemTier::Local) => self.local += 1,
            (MemTier::Local, MemTier::Remote) => self.local -= 1,
            _ => {}
        }
        Ok(previous)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageRecord<K>> {
        self.buckets.iter().flatten()
    }
}

/// Page index shared by the fault path and the swapper
pub struct PageIndex<K> {
    table: RwLock<IndexTable<K>>,
}

impl<K: PageKey> PageIndex<K> {
    pub fn new(hash_bits: u8) -> Self {
        Self {
            table: RwLock::new(IndexTable::new(hash_bits)),
        }
    }

    pub fn find(&self, key: &K) -> Option<PageRecord<K>> {
        self.table.read().get(key).cloned()
    }

    /// Track a new page. Fails if `entry_ref` is already tracked.
    pub fn insert(&self, entry_ref: K, frame: Pfn, gfn: Gfn, level: u8, tier: MemTier) -> IndexResult<()> {
        self.table
            .write()
            .insert(PageRecord::new(entry_ref, frame, gfn, level, tier))
    }

    pub fn remove(&self, key: &K) -> IndexResult<PageRecord<K>> {
        self.table.write().remove(key)
    }

    pub fn set_tier(&self, key: &K, tier: MemTier) -> IndexResult<MemTier> {
        self.table.write().set_tier(key, tier)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn local_count(&self) -> usize {
        self.table.read().local_count()
    }

    pub fn remote_count(&self) -> usize {
        self.table.read().remote_count()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.read().bucket_count()
    }

    /// Copy of every record, in bucket order.
    pub fn snapshot(&self) -> Vec<PageRecord<K>> {
        self.table.read().iter().cloned().collect()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, IndexTable<K>> {
        self.table.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, IndexTable<K>> {
        self.table.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let index = PageIndex::<u64>::new(4);
        assert_eq!(index.bucket_count(), 16);

        index.insert(0x1000, 10, 1, 1, MemTier::Local).unwrap();
        index.insert(0x2000, 20, 2, 1, MemTier::Remote).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.local_count(), 1);
        assert_eq!(index.remote_count(), 1);

        let rec = index.find(&0x1000).unwrap();
        assert_eq!(rec.frame, 10);
        assert_eq!(rec.guest_frame_number, 1);
        assert!(index.find(&0x3000).is_none());

        let removed = index.remove(&0x1000).unwrap();
        assert_eq!(removed.entry_ref, 0x1000);
        assert_eq!(index.len(), 1);
        assert_eq!(index.local_count(), 0);
        assert!(matches!(index.remove(&0x1000), Err(IndexError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_rejected() {
        let index = PageIndex::<u64>::new(2);
        index.insert(7, 1, 1, 1, MemTier::Local).unwrap();
        assert!(matches!(
            index.insert(7, 2, 2, 1, MemTier::Local),
            Err(IndexError::Duplicate(_))
        ));
        assert_eq!(index.find(&7).unwrap().frame, 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_set_tier_tracks_local_count() {
        let index = PageIndex::<u64>::new(3);
        for key in 1..=4u64 {
            index.insert(key, key, key, 1, MemTier::Local).unwrap();
        }
        assert_eq!(index.set_tier(&2, MemTier::Remote).unwrap(), MemTier::Local);
        assert_eq!(index.set_tier(&2, MemTier::Remote).unwrap(), MemTier::Remote);
        assert_eq!(index.local_count(), 3);
        assert_eq!(index.set_tier(&2, MemTier::Local).unwrap(), MemTier::Remote);
        assert_eq!(index.local_count(), 4);
        assert!(index.set_tier(&99, MemTier::Local).is_err());
    }

    #[test]
    fn test_bucket_of_in_range() {
        let index = PageIndex::<u64>::new(5);
        let table = index.read();
        for raw in [0u64, 1, u64::MAX, 0xdead_beef, 1 << 63] {
            assert!(table.bucket_of_raw(raw) < table.bucket_count());
        }
        for key in 0..1000u64 {
            assert!(table.bucket_of(&key) < 32);
        }
    }

    #[test]
    fn test_snapshot_covers_all() {
        let index = PageIndex::<u64>::new(2);
        for key in 1..=50u64 {
            index.insert(key, key, key, 1, MemTier::Local).unwrap();
        }
        let mut keys: Vec<_> = index.snapshot().into_iter().map(|r| r.entry_ref).collect();
        keys.sort();
        assert_eq!(keys, (1..=50).collect::<Vec<_>>());
    }
}
