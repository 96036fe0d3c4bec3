//------------ Placement Policies --------------------------------------------

//! Placement policies decide which tier an entry belongs in.
//!
//! A policy is consulted on every write, to pick the tier for the new
//! version, and by migration, to find the entries that should move. It is a
//! total function: for every entry it names exactly one tier. Policies only
//! see the metadata of an entry and the occupancy of the tiers, never the
//! payload.
//!
//! Two named policies are provided, [RecentInMemory] and
//! [FrequentInMemory]. Any other implementation of [PlacementPolicy] can be
//! handed to [new_with_policy](crate::rib::TieredRib::new_with_policy).

use crate::rib::config::HybridStorageConfig;
use crate::types::TierLocation;

//------------ EntryMeta -----------------------------------------------------

/// What a policy knows about an entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    /// The tier currently holding the entry, `None` for a prefix that is
    /// being written for the first time.
    pub current: Option<TierLocation>,
    /// Milliseconds since the UNIX epoch of the last read or write.
    pub last_access: u64,
    /// Number of reads and writes since the entry was indexed.
    pub access_count: u64,
    /// Size of the payload in bytes.
    pub size: usize,
}

//------------ TierState -----------------------------------------------------

/// The occupancy of the memory tier, as seen by a policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TierState {
    pub memory_len: usize,
    /// The memory threshold. The memory tier never holds more entries.
    pub memory_high: usize,
    /// The size that demotion brings the memory tier down to.
    pub memory_low: usize,
    /// Milliseconds since the UNIX epoch.
    pub now: u64,
}

impl TierState {
    pub fn memory_full(&self) -> bool {
        self.memory_len >= self.memory_high
    }

    pub fn above_low(&self) -> bool {
        self.memory_len > self.memory_low
    }

    pub fn below_low(&self) -> bool {
        self.memory_len < self.memory_low
    }
}

//------------ PlacementPolicy -----------------------------------------------

pub trait PlacementPolicy: Send + Sync + std::fmt::Debug {
    /// The name of the policy, for logging.
    fn name(&self) -> &'static str;

    /// The tier `meta` belongs in, given the state of the tiers.
    fn place(&self, meta: &EntryMeta, tiers: &TierState) -> TierLocation;
}

//------------ RecentInMemory ------------------------------------------------

/// Keep recently written and read entries in memory.
///
/// New writes go to memory while it has room. Memory-resident entries are
/// demoted while memory is above its low watermark, least recently used
/// first (migration picks the candidates in that order). Disk-resident
/// entries accessed within the recent window are promoted while memory is
/// below its low watermark.
#[derive(Clone, Debug)]
pub struct RecentInMemory {
    recent_window_ms: u64,
}

impl RecentInMemory {
    pub fn new(recent_window_secs: u64) -> Self {
        Self {
            recent_window_ms: recent_window_secs.saturating_mul(1000),
        }
    }
}

impl Default for RecentInMemory {
    fn default() -> Self {
        Self::new(300)
    }
}

impl PlacementPolicy for RecentInMemory {
    fn name(&self) -> &'static str {
        "recent_in_memory"
    }

    fn place(&self, meta: &EntryMeta, tiers: &TierState) -> TierLocation {
        match meta.current {
            None => {
                if tiers.memory_full() {
                    TierLocation::Disk
                } else {
                    TierLocation::Memory
                }
            }
            Some(TierLocation::Memory) => {
                if tiers.above_low() {
                    TierLocation::Disk
                } else {
                    TierLocation::Memory
                }
            }
            Some(TierLocation::Disk) => {
                let recent = tiers.now.saturating_sub(meta.last_access)
                    <= self.recent_window_ms;
                if recent && tiers.below_low() {
                    TierLocation::Memory
                } else {
                    TierLocation::Disk
                }
            }
        }
    }
}

//------------ FrequentInMemory ----------------------------------------------

/// Keep frequently accessed entries in memory.
///
/// Like [RecentInMemory], except that entries with at least `min_hits`
/// accesses stay in memory as long as memory is not completely full, and
/// disk-resident entries are promoted once they reach `min_hits`.
#[derive(Clone, Debug)]
pub struct FrequentInMemory {
    min_hits: u64,
}

impl FrequentInMemory {
    pub fn new(min_hits: u64) -> Self {
        Self { min_hits }
    }
}

impl Default for FrequentInMemory {
    fn default() -> Self {
        Self::new(4)
    }
}

impl PlacementPolicy for FrequentInMemory {
    fn name(&self) -> &'static str {
        "frequent_in_memory"
    }

    fn place(&self, meta: &EntryMeta, tiers: &TierState) -> TierLocation {
        let frequent = meta.access_count >= self.min_hits;
        match meta.current {
            None => {
                if tiers.memory_full() {
                    TierLocation::Disk
                } else {
                    TierLocation::Memory
                }
            }
            Some(TierLocation::Memory) => {
                if tiers.memory_full() || (tiers.above_low() && !frequent) {
                    TierLocation::Disk
                } else {
                    TierLocation::Memory
                }
            }
            Some(TierLocation::Disk) => {
                if frequent && tiers.below_low() {
                    TierLocation::Memory
                } else {
                    TierLocation::Disk
                }
            }
        }
    }
}

// The policy for one of the named strategies. `None` for the strategies
// that have no built-in policy.
pub(crate) fn named_policy(
    config: &HybridStorageConfig,
) -> Option<Box<dyn PlacementPolicy>> {
    use crate::rib::config::PlacementStrategy;

    match config.placement_strategy {
        PlacementStrategy::RecentInMemory => {
            Some(Box::new(RecentInMemory::new(config.recent_window_secs)))
        }
        PlacementStrategy::FrequentInMemory => {
            Some(Box::new(FrequentInMemory::new(config.frequent_min_hits)))
        }
        PlacementStrategy::PeerBasedMemory | PlacementStrategy::Custom => None,
    }
}
