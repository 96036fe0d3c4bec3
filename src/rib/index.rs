//------------ Location Index ------------------------------------------------

// The index records, for every known prefix, which tier holds its
// authoritative copy, its current version and whether it is withdrawn. It
// also keeps the access statistics the placement policies work with.
//
// Slots are only ever changed while holding the lock for their prefix (see
// `PrefixLocks`). Readers take no locks: they load the fields of a slot
// individually, and deal with a slot changing under their feet by falling
// back to the other tier.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use crossbeam_utils::CachePadded;
use inetnum::addr::Prefix;
use parking_lot::{Mutex, MutexGuard};

use crate::types::prefix_key::PrefixKey;
use crate::types::TierLocation;

//------------ IndexSlot -----------------------------------------------------

#[derive(Debug)]
pub(crate) struct IndexSlot {
    prefix: Prefix,
    tier: AtomicU8,
    version: AtomicU64,
    tombstone: AtomicBool,
    last_access: AtomicU64,
    access_count: AtomicU64,
    size: AtomicUsize,
}

impl IndexSlot {
    fn new(prefix: Prefix, tier: TierLocation, version: u64) -> Self {
        Self {
            prefix,
            tier: AtomicU8::new(tier as u8),
            version: AtomicU64::new(version),
            tombstone: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
            size: AtomicUsize::new(0),
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn tier(&self) -> TierLocation {
        TierLocation::from_u8(self.tier.load(Ordering::Acquire))
            .unwrap_or(TierLocation::Disk)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    // Record a new version. The tier is stored last, so that a reader that
    // sees the new tier also sees the new version.
    pub fn set(
        &self,
        tier: TierLocation,
        version: u64,
        tombstone: bool,
        size: usize,
    ) {
        self.version.store(version, Ordering::Release);
        self.tombstone.store(tombstone, Ordering::Release);
        self.size.store(size, Ordering::Relaxed);
        self.tier.store(tier as u8, Ordering::Release);
    }

    pub fn set_tier(&self, tier: TierLocation) {
        self.tier.store(tier as u8, Ordering::Release);
    }

    pub fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }
}

//------------ LocationIndex -------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct LocationIndex {
    slots: SkipMap<PrefixKey, Arc<IndexSlot>>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, prefix: &Prefix) -> Option<Arc<IndexSlot>> {
        self.slots
            .get(&PrefixKey::from(prefix))
            .map(|e| e.value().clone())
    }

    /// Add a slot for `prefix`. The caller holds the prefix lock and has
    /// checked that there is no slot yet.
    pub fn insert(
        &self,
        prefix: Prefix,
        tier: TierLocation,
        version: u64,
        tombstone: bool,
        size: usize,
    ) -> Arc<IndexSlot> {
        let slot = Arc::new(IndexSlot::new(prefix, tier, version));
        slot.set(tier, version, tombstone, size);
        self.slots.insert(PrefixKey::from(&prefix), slot.clone());
        slot
    }

    pub fn remove(&self, prefix: &Prefix) -> bool {
        self.slots.remove(&PrefixKey::from(prefix)).is_some()
    }

    /// Remove the slot for `prefix` if `pred` holds for it.
    pub fn remove_if(
        &self,
        prefix: &Prefix,
        pred: impl Fn(&IndexSlot) -> bool,
    ) -> bool {
        match self.slots.get(&PrefixKey::from(prefix)) {
            Some(e) if pred(e.value()) => e.remove(),
            _ => false,
        }
    }

    /// The number of slots, withdrawn prefixes included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// All slots, in prefix order.
    pub fn slots(&self) -> impl Iterator<Item = Arc<IndexSlot>> + '_ {
        self.slots.iter().map(|e| e.value().clone())
    }
}

//------------ PrefixLocks ---------------------------------------------------

// The per-prefix ordering point. Prefixes are hashed onto a fixed number of
// mutexes, so two prefixes may share a lock. A thread never holds more than
// one of these locks at a time.
pub(crate) struct PrefixLocks {
    shards: Box<[CachePadded<Mutex<()>>]>,
    hasher: std::collections::hash_map::RandomState,
}

impl std::fmt::Debug for PrefixLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrefixLocks({} shards)", self.shards.len())
    }
}

impl PrefixLocks {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| CachePadded::new(Mutex::new(())))
                .collect(),
            hasher: Default::default(),
        }
    }

    // The modulo keeps the index in bounds, `new` makes sure there is at
    // least one shard.
    #[allow(clippy::indexing_slicing)]
    fn shard(&self, prefix: &Prefix) -> &Mutex<()> {
        let idx = self.hasher.hash_one(PrefixKey::from(prefix)) as usize
            % self.shards.len();
        &self.shards[idx]
    }

    pub fn lock(&self, prefix: &Prefix) -> MutexGuard<'_, ()> {
        self.shard(prefix).lock()
    }

    pub fn try_lock_for(
        &self,
        prefix: &Prefix,
        timeout: Duration,
    ) -> Option<MutexGuard<'_, ()>> {
        self.shard(prefix).try_lock_for(timeout)
    }
}

impl Default for PrefixLocks {
    fn default() -> Self {
        Self::new(1024)
    }
}
