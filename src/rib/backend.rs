//------------ Backend -------------------------------------------------------

// The tiers that are active for a RIB, selected once at construction from
// the storage configuration. The router and the background workers only
// talk to the tiers through the capability accessors, so they work the same
// for all three backends.

use std::sync::Arc;

use inetnum::addr::Prefix;
use log::{info, warn};

use crate::disk_tier::DiskTier;
use crate::errors::EngineError;
use crate::hot_cache::HotCache;
use crate::memory_tier::MemoryTier;
use crate::rib::config::StorageConfig;
use crate::stats::{Counters, TierUsage};
use crate::types::{RouteEntry, TierLocation};

#[derive(Debug)]
pub(crate) enum Backend {
    Memory(MemoryTier),
    Disk {
        disk: DiskTier,
        cache: HotCache,
    },
    Hybrid {
        memory: MemoryTier,
        disk: DiskTier,
        cache: HotCache,
    },
}

impl Backend {
    pub fn open(
        config: &StorageConfig,
        counters: Arc<Counters>,
    ) -> Result<Self, EngineError> {
        let backend = match config {
            StorageConfig::Memory(c) => Backend::Memory(MemoryTier::new(
                c.max_entries.unwrap_or(usize::MAX),
            )),
            StorageConfig::Disk(c) => Backend::Disk {
                disk: DiskTier::open(c, counters)?,
                cache: HotCache::new(c.cache_size),
            },
            StorageConfig::Hybrid(c) => {
                if c.memory.max_entries.is_some() {
                    warn!(
                        "memory.max_entries is ignored for the hybrid \
                        backend, memory_threshold bounds the memory tier"
                    );
                }
                Backend::Hybrid {
                    memory: MemoryTier::new(c.memory_threshold),
                    disk: DiskTier::open(&c.disk, counters)?,
                    cache: HotCache::new(c.disk.cache_size),
                }
            }
        };
        info!("opened {} backend", backend.storage_type());
        Ok(backend)
    }

    pub fn storage_type(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::Disk { .. } => "disk",
            Backend::Hybrid { .. } => "hybrid",
        }
    }

    pub fn memory(&self) -> Option<&MemoryTier> {
        match self {
            Backend::Memory(memory) | Backend::Hybrid { memory, .. } => {
                Some(memory)
            }
            Backend::Disk { .. } => None,
        }
    }

    pub fn disk(&self) -> Option<&DiskTier> {
        match self {
            Backend::Memory(_) => None,
            Backend::Disk { disk, .. } | Backend::Hybrid { disk, .. } => {
                Some(disk)
            }
        }
    }

    pub fn cache(&self) -> Option<&HotCache> {
        match self {
            Backend::Memory(_) => None,
            Backend::Disk { cache, .. } | Backend::Hybrid { cache, .. } => {
                Some(cache).filter(|c| c.is_enabled())
            }
        }
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, Backend::Hybrid { .. })
    }

    /// The tier fresh writes go to when there is no placement policy.
    pub fn default_tier(&self) -> TierLocation {
        match self {
            Backend::Memory(_) => TierLocation::Memory,
            Backend::Disk { .. } | Backend::Hybrid { .. } => {
                TierLocation::Disk
            }
        }
    }

    /// The current entry for `prefix` in `tier`, tombstones excluded.
    /// Returns `None` if the tier is not active.
    pub fn read(
        &self,
        tier: TierLocation,
        prefix: &Prefix,
    ) -> Result<Option<RouteEntry>, EngineError> {
        match tier {
            TierLocation::Memory => {
                Ok(self.memory().and_then(|m| m.get(prefix)))
            }
            TierLocation::Disk => match self.disk() {
                Some(disk) => disk.get(prefix),
                None => Ok(None),
            },
        }
    }

    /// Store `entry` in `tier`.
    pub fn write(
        &self,
        tier: TierLocation,
        entry: &RouteEntry,
    ) -> Result<(), EngineError> {
        match tier {
            TierLocation::Memory => self
                .memory()
                .ok_or(EngineError::CapacityExceeded)?
                .put(entry.clone()),
            TierLocation::Disk => self
                .disk()
                .ok_or(EngineError::StorageExhausted)?
                .put(entry),
        }
    }

    /// Remove everything stored for `prefix` in `tier`.
    pub fn remove(
        &self,
        tier: TierLocation,
        prefix: &Prefix,
    ) -> Result<(), EngineError> {
        match tier {
            TierLocation::Memory => {
                if let Some(memory) = self.memory() {
                    memory.delete(prefix);
                }
                Ok(())
            }
            TierLocation::Disk => {
                if let Some(disk) = self.disk() {
                    disk.evict(prefix)?;
                }
                Ok(())
            }
        }
    }

    /// Remove the copy of `prefix` with exactly `version` from `tier`,
    /// leaving any other copy alone.
    pub fn remove_version(
        &self,
        tier: TierLocation,
        prefix: &Prefix,
        version: u64,
    ) -> Result<(), EngineError> {
        match tier {
            TierLocation::Memory => {
                if let Some(memory) = self.memory() {
                    if memory.get(prefix).is_some_and(|e| e.version == version)
                    {
                        memory.delete(prefix);
                    }
                }
                Ok(())
            }
            TierLocation::Disk => {
                if let Some(disk) = self.disk() {
                    disk.remove_version(prefix, version)?;
                }
                Ok(())
            }
        }
    }

    pub fn invalidate(&self, prefix: &Prefix) {
        if let Some(cache) = self.cache() {
            cache.invalidate(prefix);
        }
    }

    pub fn usage(&self, indexed_prefixes: usize) -> TierUsage {
        let memory = self.memory();
        let disk = self.disk();
        TierUsage {
            storage_type: self.storage_type(),
            memory_entries: memory.map(|m| m.size()).unwrap_or(0),
            memory_threshold: memory
                .map(|m| m.capacity())
                .filter(|c| *c != usize::MAX)
                .unwrap_or(0),
            disk_usage_bytes: disk.map(|d| d.size_bytes()).unwrap_or(0),
            disk_space_bytes: disk.map(|d| d.disk_space()).unwrap_or(0),
            disk_degraded: disk.is_some_and(|d| d.is_degraded()),
            indexed_prefixes,
        }
    }
}
