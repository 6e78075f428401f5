//! Tracked guest page metadata

use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Page size constants
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Host physical frame number
pub type Pfn = u64;
/// Guest frame number
pub type Gfn = u64;

/// Frame number of an entry that is not backed by a host frame yet.
/// Such records are never eviction candidates.
pub const NO_FRAME: Pfn = u64::MAX;

/// Leaf (4KB) page-table level; the only level eligible for eviction
pub const LEAF_LEVEL: u8 = 1;

/// Identifier of a page-table slot.
///
/// The simulator never dereferences a key; it only hashes and compares it.
/// A key may report itself as null (the fault handler passed no slot), in
/// which case the fault is bounced back to the caller.
pub trait PageKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn is_null(&self) -> bool {
        false
    }
}

impl PageKey for u64 {
    fn is_null(&self) -> bool {
        *self == 0
    }
}

impl PageKey for u32 {
    fn is_null(&self) -> bool {
        *self == 0
    }
}

impl PageKey for usize {
    fn is_null(&self) -> bool {
        *self == 0
    }
}

impl<T: PageKey> PageKey for Option<T> {
    fn is_null(&self) -> bool {
        self.as_ref().map_or(true, PageKey::is_null)
    }
}

/// Memory tier a guest page currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemTier {
    /// Bounded fast pool
    Local,
    /// Unbounded network-backed pool
    Remote,
}

/// LRU list a page was isolated from by the reclamation primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LruClass {
    ActiveAnon,
    InactiveAnon,
    ActiveFile,
    InactiveFile,
}

impl LruClass {
    pub const ALL: [LruClass; 4] = [
        LruClass::ActiveAnon,
        LruClass::InactiveAnon,
        LruClass::ActiveFile,
        LruClass::InactiveFile,
    ];

    pub fn index(&self) -> usize {
        match self {
            LruClass::ActiveAnon => 0,
            LruClass::InactiveAnon => 1,
            LruClass::ActiveFile => 2,
            LruClass::InactiveFile => 3,
        }
    }

    pub fn is_anon(&self) -> bool {
        matches!(self, LruClass::ActiveAnon | LruClass::InactiveAnon)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LruClass::ActiveAnon | LruClass::ActiveFile)
    }
}

/// One tracked guest page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord<K> {
    /// Page-table slot this record belongs to
    pub entry_ref: K,
    /// Backing host frame, or [`NO_FRAME`]
    pub frame: Pfn,
    /// Guest-visible frame number (diagnostics, future TLB shootdown)
    pub guest_frame_number: Gfn,
    /// Page-table depth the entry was installed at
    pub mapping_level: u8,
    pub tier: MemTier,
}

impl<K: PageKey> PageRecord<K> {
    pub fn new(entry_ref: K, frame: Pfn, guest_frame_number: Gfn, mapping_level: u8, tier: MemTier) -> Self {
        Self {
            entry_ref,
            frame,
            guest_frame_number,
            mapping_level,
            tier,
        }
    }

    pub fn is_local(&self) -> bool {
        self.tier == MemTier::Local
    }

    pub fn has_frame(&self) -> bool {
        self.frame != NO_FRAME
    }

    /// Huge-page mappings (level > 1) are never subdivided or evicted.
    pub fn is_evictable(&self) -> bool {
        self.is_local() && self.has_frame() && self.mapping_level == LEAF_LEVEL
    }
}
