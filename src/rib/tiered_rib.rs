use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::Backoff;
use inetnum::addr::Prefix;
use log::{debug, info, trace, warn};

use crate::errors::EngineError;
use crate::placement::{named_policy, EntryMeta, PlacementPolicy, TierState};
use crate::rib::backend::Backend;
use crate::rib::compaction::{CompactionReport, Compactor};
use crate::rib::config::{PlacementStrategy, StorageConfig, SyncMode};
use crate::rib::index::{IndexSlot, LocationIndex, PrefixLocks};
use crate::rib::migration::{
    MigrationCoordinator, MigrationReport, MigrationTrigger,
};
use crate::rib::worker::{Wake, Worker};
use crate::stats::{Counters, EngineStats, Operation};
use crate::types::{
    covering_prefix, max_len, now_ms, Payload, RouteEntry, RouteEvent,
    RouteOperation, TierLocation,
};

//------------ RibState ------------------------------------------------------

// Everything the router and the background workers share. The workers get
// their own `Arc` to it, and never talk to the router directly.
#[derive(Debug)]
pub(crate) struct RibState {
    pub backend: Backend,
    pub index: LocationIndex,
    pub locks: PrefixLocks,
    // Only set for the hybrid backend.
    pub policy: Option<Box<dyn PlacementPolicy>>,
    pub counters: Arc<Counters>,
    pub memory_high: usize,
    pub memory_low: usize,
    pub migration: MigrationCoordinator,
    pub compactor: Compactor,
}

impl RibState {
    pub fn tier_state(&self, memory_len: usize, now: u64) -> TierState {
        TierState {
            memory_len,
            memory_high: self.memory_high,
            memory_low: self.memory_low,
            now,
        }
    }

    fn memory_len(&self) -> usize {
        self.backend.memory().map(|m| m.size()).unwrap_or(0)
    }

    // After a restart everything the engine knows is on disk. The memory
    // tier fills up again through writes and promotions.
    fn rebuild_index(&self) {
        let Some(disk) = self.backend.disk() else {
            return;
        };
        let mut withdrawn = 0;
        for prefix in disk.prefixes() {
            if let Some((version, tombstone)) = disk.newest_version(&prefix) {
                withdrawn += usize::from(tombstone);
                self.index.insert(
                    prefix,
                    TierLocation::Disk,
                    version,
                    tombstone,
                    0,
                );
            }
        }
        if self.index.len() > 0 {
            info!(
                "indexed {} prefixes from {} ({} withdrawn)",
                self.index.len(),
                disk.path().display(),
                withdrawn
            );
        }
    }
}

//------------ TieredRib -----------------------------------------------------

/// A RIB that keeps its routes in memory, on disk, or both.
///
/// Every prefix has exactly one authoritative copy, in one of the tiers, and
/// a version number that is bumped on every write. Which tiers are active
/// is decided by the [StorageConfig] the RIB is created with. With the
/// hybrid backend a [PlacementPolicy] decides where new versions go, and a
/// background worker migrates entries between the tiers. With a disk tier
/// another worker compacts the stored versions periodically.
///
/// All methods take `&self`, a RIB can be shared between threads in an
/// `Arc`. Writes to the same prefix are serialized, everything else runs in
/// parallel. Reads never take a lock.
#[derive(Debug)]
pub struct TieredRib {
    state: Arc<RibState>,
    config: StorageConfig,
    migration_worker: Option<Worker>,
    compaction_worker: Option<Worker>,
    sync_worker: Option<Worker>,
    closed: bool,
}

impl TieredRib {
    /// Create a new RIB with the default configuration, that keeps all its
    /// routes in memory.
    ///
    /// This method is really infallible, but returns a result to be in line
    /// with [new_with_config](Self::new_with_config).
    pub fn try_default() -> Result<Self, EngineError> {
        Self::new_with_config(StorageConfig::default())
    }

    /// Create a new RIB with the specified configuration.
    ///
    /// Fails with [EngineError::ConfigInvalid] if the configuration does not
    /// validate, or names the `custom` placement strategy, for which
    /// [new_with_policy](Self::new_with_policy) should be used. Fails with
    /// [EngineError::IoFailure] if the disk tier cannot be opened.
    pub fn new_with_config(
        config: StorageConfig,
    ) -> Result<Self, EngineError> {
        Self::build(config, None)
    }

    /// Create a new hybrid RIB that places its entries with `policy`,
    /// instead of the policy named in the configuration.
    pub fn new_with_policy(
        config: StorageConfig,
        policy: Box<dyn PlacementPolicy>,
    ) -> Result<Self, EngineError> {
        if !matches!(config, StorageConfig::Hybrid(_)) {
            return Err(EngineError::ConfigInvalid(format!(
                "a placement policy needs the hybrid backend, not {}",
                config.storage_type()
            )));
        }
        Self::build(config, Some(policy))
    }

    fn build(
        config: StorageConfig,
        custom: Option<Box<dyn PlacementPolicy>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let policy = match &config {
            StorageConfig::Hybrid(c) => match custom {
                Some(policy) => {
                    if c.placement_strategy != PlacementStrategy::Custom {
                        info!(
                            "placement policy {} replaces {}",
                            policy.name(),
                            c.placement_strategy.as_str()
                        );
                    }
                    Some(policy)
                }
                None => Some(named_policy(c).ok_or_else(|| {
                    EngineError::ConfigInvalid(
                        "placement strategy custom needs a policy, see \
                        TieredRib::new_with_policy"
                            .to_string(),
                    )
                })?),
            },
            StorageConfig::Memory(_) | StorageConfig::Disk(_) => None,
        };

        let (memory_high, memory_low, batch_size) = match &config {
            StorageConfig::Hybrid(c) => (
                c.memory_threshold,
                c.memory_low_watermark(),
                c.migration_batch_size,
            ),
            StorageConfig::Memory(c) => {
                let max = c.max_entries.unwrap_or(usize::MAX);
                (max, max, 1)
            }
            StorageConfig::Disk(_) => (0, 0, 1),
        };
        let retention = config
            .disk()
            .map(|d| d.tombstone_retention_secs)
            .unwrap_or(0);

        let counters = Arc::new(Counters::default());
        let backend = Backend::open(&config, counters.clone())?;
        let state = Arc::new(RibState {
            backend,
            index: LocationIndex::new(),
            locks: PrefixLocks::default(),
            policy,
            counters,
            memory_high,
            memory_low,
            migration: MigrationCoordinator::new(batch_size),
            compactor: Compactor::new(retention),
        });
        state.rebuild_index();

        let mut rib = Self {
            state,
            config,
            migration_worker: None,
            compaction_worker: None,
            sync_worker: None,
            closed: false,
        };
        rib.spawn_workers()?;
        if let Some(policy) = rib.state.policy.as_deref() {
            info!("placing entries with the {} policy", policy.name());
        }
        Ok(rib)
    }

    fn spawn_workers(&mut self) -> Result<(), EngineError> {
        if let StorageConfig::Hybrid(c) = &self.config {
            let state = self.state.clone();
            let interval = c
                .auto_migration
                .then(|| Duration::from_millis(c.migration_interval_ms));
            let job = move |wake, cancel: &AtomicBool| {
                let trigger = match wake {
                    Wake::Start => {
                        state.migration.recover(&state, false);
                        return;
                    }
                    Wake::Trigger => MigrationTrigger::Threshold,
                    Wake::Tick => MigrationTrigger::Tick,
                };
                state.migration.run(&state, trigger, cancel, false);
            };
            self.migration_worker =
                Some(Worker::spawn("migration", interval, job)?);
        }

        if let Some(disk) = self.config.disk() {
            let state = self.state.clone();
            let interval =
                Duration::from_secs(disk.compaction_interval_secs);
            self.compaction_worker = Some(Worker::spawn(
                "compaction",
                Some(interval),
                move |wake, cancel| {
                    if wake == Wake::Start {
                        return;
                    }
                    let res = state.compactor.run(&state, cancel, false);
                    if let Err(err) = res {
                        state.counters.inc_error(Operation::Compaction, &err);
                        warn!("compaction failed: {}", err);
                    }
                },
            )?);

            if disk.sync_mode == SyncMode::Normal {
                let state = self.state.clone();
                let interval = Duration::from_millis(disk.sync_interval_ms);
                self.sync_worker =
                    Some(Worker::spawn("sync", Some(interval), move |wake, _| {
                        if wake != Wake::Tick {
                            return;
                        }
                        if let Some(Err(err)) =
                            state.backend.disk().map(|d| d.sync())
                        {
                            warn!("periodic sync failed: {}", err);
                        }
                    })?);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    //-------- Writes --------------------------------------------------------

    /// Apply an ingestion event to `prefix`. Returns the version assigned to
    /// the write.
    ///
    /// `Insert` and `Update` both store `payload` as the new version of the
    /// prefix, whether it was known before or not. `Withdraw` ignores
    /// `payload` and records a tombstone. Withdrawing an unknown prefix is a
    /// no-op that returns version 0, withdrawing a withdrawn prefix returns
    /// the version of its tombstone.
    pub fn apply(
        &self,
        prefix: Prefix,
        operation: RouteOperation,
        payload: impl Into<Payload>,
    ) -> Result<u64, EngineError> {
        let res = match operation {
            RouteOperation::Insert | RouteOperation::Update => {
                self.upsert(prefix, payload.into())
            }
            RouteOperation::Withdraw => self.withdraw(prefix),
        };
        match &res {
            Ok(version) => {
                trace!("{} {} -> v{}", operation, prefix, version);
            }
            Err(err) => {
                self.state.counters.inc_error(Operation::Apply, err);
                debug!("{} {} failed: {}", operation, prefix, err);
            }
        }
        res
    }

    pub fn apply_event(&self, event: RouteEvent) -> Result<u64, EngineError> {
        self.apply(event.prefix, event.operation, event.payload)
    }

    fn upsert(
        &self,
        prefix: Prefix,
        payload: Payload,
    ) -> Result<u64, EngineError> {
        let s = &self.state;
        let now = now_ms();
        let _guard = s.locks.lock(&prefix);

        let slot = s.index.get(&prefix);
        let version =
            slot.as_ref().map(|slot| slot.version()).unwrap_or(0) + 1;
        // Where something may be stored for the prefix, tombstones included.
        let stored = slot.as_ref().map(|slot| slot.tier());
        let entry = RouteEntry::new(prefix, payload, version);
        let size = entry.payload.len();

        let mut target = self.place(slot.as_deref(), size, now);
        match s.backend.write(target, &entry) {
            Ok(()) => {}
            Err(EngineError::CapacityExceeded)
                if s.backend.disk().is_some() =>
            {
                self.nudge_migration();
                target = TierLocation::Disk;
                s.backend.write(target, &entry)?;
            }
            Err(err) => return Err(err),
        }

        let slot = match slot {
            Some(slot) => {
                slot.set(target, version, false, size);
                slot
            }
            None => s.index.insert(prefix, target, version, false, size),
        };
        slot.touch(now);

        if let Some(old) = stored.filter(|old| *old != target) {
            if let Err(err) = s.backend.remove(old, &prefix) {
                // The index no longer points at it, compaction or the next
                // write takes care of it.
                warn!(
                    "could not remove {} from the {} tier: {}",
                    prefix, old, err
                );
            }
        }
        s.backend.invalidate(&prefix);

        if s.backend.is_hybrid() && s.memory_len() >= s.memory_high {
            self.nudge_migration();
        }
        Ok(version)
    }

    // The tier for a new version. Updates of a memory resident entry stay
    // in memory, migration decides when it leaves.
    fn place(
        &self,
        slot: Option<&IndexSlot>,
        size: usize,
        now: u64,
    ) -> TierLocation {
        let s = &self.state;
        let Some(policy) = s.policy.as_deref() else {
            return s.backend.default_tier();
        };
        let current = slot
            .filter(|slot| !slot.is_tombstone())
            .map(|slot| slot.tier());
        if current == Some(TierLocation::Memory) {
            return TierLocation::Memory;
        }
        let meta = EntryMeta {
            current,
            last_access: now,
            access_count: slot.map(|slot| slot.access_count()).unwrap_or(0)
                + 1,
            size,
        };
        policy.place(&meta, &s.tier_state(s.memory_len(), now))
    }

    fn withdraw(&self, prefix: Prefix) -> Result<u64, EngineError> {
        let s = &self.state;
        let _guard = s.locks.lock(&prefix);

        let Some(slot) = s.index.get(&prefix) else {
            return Ok(0);
        };
        if slot.is_tombstone() {
            return Ok(slot.version());
        }
        let version = slot.version() + 1;

        match s.backend.disk() {
            // Nothing to compact without a disk, the prefix is forgotten
            // right away.
            None => {
                s.backend.remove(TierLocation::Memory, &prefix)?;
                s.index.remove(&prefix);
            }
            Some(disk) => {
                disk.delete(&prefix, version)?;
                let old = slot.tier();
                slot.set(TierLocation::Disk, version, true, 0);
                slot.touch(now_ms());
                if old == TierLocation::Memory {
                    s.backend.remove(TierLocation::Memory, &prefix)?;
                }
                s.backend.invalidate(&prefix);
            }
        }
        Ok(version)
    }

    /// Store `payload` as the new version of `prefix`.
    pub fn insert(
        &self,
        prefix: Prefix,
        payload: impl Into<Payload>,
    ) -> Result<u64, EngineError> {
        self.apply(prefix, RouteOperation::Insert, payload)
    }

    /// Withdraw `prefix`.
    pub fn withdraw_prefix(&self, prefix: Prefix) -> Result<u64, EngineError> {
        self.apply(prefix, RouteOperation::Withdraw, Payload::empty())
    }

    //-------- Reads ---------------------------------------------------------

    /// The current entry for `prefix`. Absent if the prefix is unknown or
    /// withdrawn.
    pub fn get(
        &self,
        prefix: &Prefix,
    ) -> Result<Option<RouteEntry>, EngineError> {
        let res = self.read(prefix);
        if let Err(err) = &res {
            self.state.counters.inc_error(Operation::Get, err);
        }
        res
    }

    /// The entry for the most specific prefix that covers `addr`.
    ///
    /// Candidates are tried from the longest mask down. There is only one
    /// candidate prefix per mask length, so the result is the same whichever
    /// tier the entries live in.
    pub fn longest_match(
        &self,
        addr: IpAddr,
    ) -> Result<Option<RouteEntry>, EngineError> {
        let res = self.find_longest(addr);
        if let Err(err) = &res {
            self.state.counters.inc_error(Operation::LongestMatch, err);
        }
        res
    }

    fn find_longest(
        &self,
        addr: IpAddr,
    ) -> Result<Option<RouteEntry>, EngineError> {
        for len in (0..=max_len(&addr)).rev() {
            let Some(candidate) = covering_prefix(addr, len) else {
                continue;
            };
            if let Some(entry) = self.read(&candidate)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn read(
        &self,
        prefix: &Prefix,
    ) -> Result<Option<RouteEntry>, EngineError> {
        let backoff = Backoff::new();
        loop {
            let Some(slot) = self.state.index.get(prefix) else {
                return Ok(None);
            };
            if slot.is_tombstone() {
                return Ok(None);
            }
            // The slot may flip while we read, in which case the entry has
            // already been copied to the other tier.
            let tier = slot.tier();
            let found = match self.read_tier(tier, prefix, &slot)? {
                Some(entry) => Some(entry),
                None => self.read_tier(tier.other(), prefix, &slot)?,
            };
            if let Some(entry) = found {
                slot.touch(now_ms());
                return Ok(Some(entry));
            }
            if backoff.is_completed() {
                debug!("{} is indexed, but in neither tier", prefix);
                return Ok(None);
            }
            backoff.snooze();
        }
    }

    fn read_tier(
        &self,
        tier: TierLocation,
        prefix: &Prefix,
        slot: &IndexSlot,
    ) -> Result<Option<RouteEntry>, EngineError> {
        let s = &self.state;
        if tier == TierLocation::Memory {
            return s.backend.read(tier, prefix);
        }
        let Some(disk) = s.backend.disk() else {
            return Ok(None);
        };
        let cache = s.backend.cache();
        if let Some(cache) = cache {
            if let Some(entry) = cache.get(prefix, slot.version()) {
                s.counters.inc_cache_hits();
                return Ok(Some(entry));
            }
            s.counters.inc_cache_misses();
        }
        let entry = disk.get(prefix)?;
        if let (Some(entry), Some(cache)) = (&entry, cache) {
            cache.populate(entry);
        }
        Ok(entry)
    }

    /// Whether `prefix` has a current, not withdrawn, entry.
    pub fn contains(&self, prefix: &Prefix) -> bool {
        self.state
            .index
            .get(prefix)
            .is_some_and(|s| !s.is_tombstone())
    }

    /// The tier holding the current entry for `prefix`.
    pub fn location(&self, prefix: &Prefix) -> Option<TierLocation> {
        self.state
            .index
            .get(prefix)
            .filter(|s| !s.is_tombstone())
            .map(|s| s.tier())
    }

    /// The number of prefixes with a current entry.
    pub fn prefixes_count(&self) -> usize {
        self.state
            .index
            .slots()
            .filter(|s| !s.is_tombstone())
            .count()
    }

    pub fn stats(&self) -> EngineStats {
        self.state
            .counters
            .snapshot(self.state.backend.usage(self.state.index.len()))
    }

    //-------- Maintenance ---------------------------------------------------

    fn nudge_migration(&self) {
        if let Some(worker) = &self.migration_worker {
            worker.nudge();
        }
    }

    /// Run a migration batch now, demoting and promoting entries as the
    /// placement policy sees fit. Waits for a batch the background worker
    /// may be running first. Does nothing unless the backend is hybrid.
    pub fn run_migration(&self) -> MigrationReport {
        self.state.migration.run(
            &self.state,
            MigrationTrigger::Tick,
            &AtomicBool::new(false),
            true,
        )
    }

    /// Run a compaction pass now. Does nothing without a disk tier.
    pub fn run_compaction(&self) -> Result<CompactionReport, EngineError> {
        let res =
            self.state
                .compactor
                .run(&self.state, &AtomicBool::new(false), true);
        if let Err(err) = &res {
            self.state.counters.inc_error(Operation::Compaction, err);
        }
        res
    }

    /// Make all writes so far durable, regardless of the sync mode.
    pub fn sync(&self) -> Result<(), EngineError> {
        match self.state.backend.disk() {
            Some(disk) => disk.close(),
            None => Ok(()),
        }
    }

    /// Stop the background workers and flush the disk tier.
    ///
    /// The memory tier of a hybrid RIB is written to disk first, so that a
    /// RIB created with the same configuration afterwards finds all routes.
    /// If an entry cannot be written, the others still are, and the first
    /// error is returned.
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for worker in [
            &mut self.migration_worker,
            &mut self.compaction_worker,
            &mut self.sync_worker,
        ]
        .into_iter()
        .flatten()
        {
            worker.stop();
        }

        let s = &self.state;
        let Some(disk) = s.backend.disk() else {
            return Ok(());
        };
        // Keep going after a failed write, but report the first one: the
        // entry is lost once the memory tier is gone.
        let mut lost = None;
        if let Some(memory) = s.backend.memory() {
            let mut spilled = 0;
            for prefix in memory.prefixes() {
                let _guard = s.locks.lock(&prefix);
                let Some(entry) = memory.get(&prefix) else {
                    continue;
                };
                match disk.put(&entry) {
                    Ok(()) => spilled += 1,
                    Err(err) => {
                        warn!("could not write {} to disk: {}", prefix, err);
                        s.counters.inc_error(Operation::Shutdown, &err);
                        lost.get_or_insert(err);
                    }
                }
            }
            if spilled > 0 {
                info!("wrote {} memory entries to disk", spilled);
            }
        }
        disk.close()?;
        info!("closed {} RIB", s.backend.storage_type());
        match lost {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &RibState {
        &self.state
    }
}

impl Drop for TieredRib {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("closing RIB failed: {}", err);
        }
    }
}
