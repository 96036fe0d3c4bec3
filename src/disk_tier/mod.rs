//! The disk tier: all versions of all prefixes in a log-structured merge
//! tree, with an in-memory version index in front of it.
//!
//! Every write appends a new version under its own key, so the tree holds
//! the history of a prefix until compaction discards the superseded
//! versions. The version index is rebuilt from the tree when the tier is
//! opened, and answers "what is the newest version of this prefix" without
//! touching the tree.

mod record;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use inetnum::addr::Prefix;
use log::{debug, error, info, trace, warn};
use lsm_tree::AbstractTree;
use parking_lot::Mutex;
use rand::Rng;
use roaring::RoaringBitmap;
use zerocopy::{FromBytes, IntoBytes};

use crate::errors::EngineError;
use crate::rib::config::{DiskStorageConfig, RetryConfig, SyncMode};
use crate::stats::Counters;
use crate::types::prefix_key::{PrefixKey, VersionedKey, VERSIONED_KEY_SIZE};
use crate::types::{now_ms, RouteEntry};

// The number of segments the tree may have before a sync merges them.
const MAX_SEGMENTS: usize = 8;

//------------ StoredVersion -------------------------------------------------

// What the version index knows about one stored version of a prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct StoredVersion {
    pub version: u64,
    pub tombstone: bool,
    pub written_at: u64,
    // key and value bytes, as accounted against the byte budget
    pub stored_bytes: u64,
    // failed its checksum, excluded from reads
    pub quarantined: bool,
}

//------------ VersionSet ----------------------------------------------------

// All the stored versions of one prefix, oldest first. A set that has been
// emptied is marked `removed` before it is taken out of the index, so that a
// writer that still holds a reference to it starts over with a fresh set.
#[derive(Debug)]
struct VersionSet {
    prefix: Prefix,
    versions: Vec<StoredVersion>,
    removed: bool,
}

impl VersionSet {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            versions: Vec::new(),
            removed: false,
        }
    }

    fn newest(&self) -> Option<&StoredVersion> {
        self.versions.last()
    }

    fn position(&self, version: u64) -> Result<usize, usize> {
        self.versions.binary_search_by_key(&version, |v| v.version)
    }
}

//------------ PrefixCompaction ----------------------------------------------

/// The outcome of compacting the versions of one prefix.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PrefixCompaction {
    pub removed_versions: usize,
    pub reclaimed_bytes: u64,
    // The newest version, if the prefix is gone from the tier altogether.
    pub gone: Option<u64>,
    // A tombstone is still inside its retention window.
    pub pending: bool,
}

//------------ DiskTier ------------------------------------------------------

/// The on-disk tier.
///
/// Writes for the same prefix must be serialized by the caller. A read of a
/// prefix is serialized with compaction of that prefix by the version
/// index, so a read never loses the version it is reading.
pub struct DiskTier {
    tree: lsm_tree::Tree,
    path: PathBuf,
    index: SkipMap<PrefixKey, Mutex<VersionSet>>,
    seqno: AtomicU64,
    size_bytes: AtomicU64,
    max_size_bytes: Option<u64>,
    compression: bool,
    sync_mode: SyncMode,
    retry: RetryConfig,
    // key ranges that hold superseded versions, tombstones or quarantined
    // versions
    dirty: Mutex<RoaringBitmap>,
    unsynced: AtomicBool,
    flush_lock: Mutex<()>,
    degraded: AtomicBool,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for DiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTier")
            .field("path", &self.path)
            .field("prefixes", &self.index.len())
            .field("size_bytes", &self.size_bytes())
            .field("max_size_bytes", &self.max_size_bytes)
            .field("sync_mode", &self.sync_mode)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl DiskTier {
    /// Open the tier at the configured path, creating it if needed, and
    /// rebuild the version index from what is stored there.
    pub fn open(
        config: &DiskStorageConfig,
        counters: Arc<Counters>,
    ) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.path)?;
        let tree = lsm_tree::Config::new(&config.path).open()?;
        let seqno = tree.get_highest_seqno().map(|s| s + 1).unwrap_or(0);

        let tier = DiskTier {
            tree,
            path: config.path.clone(),
            index: SkipMap::new(),
            seqno: AtomicU64::new(seqno),
            size_bytes: AtomicU64::new(0),
            max_size_bytes: config.max_size_bytes,
            compression: config.compression,
            sync_mode: config.sync_mode,
            retry: config.io_retry.clone(),
            dirty: Mutex::new(RoaringBitmap::new()),
            unsynced: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
            counters,
        };
        tier.rebuild_index()?;

        info!(
            "opened disk tier at {} with {} prefixes, {} bytes",
            tier.path.display(),
            tier.index.len(),
            tier.size_bytes()
        );
        Ok(tier)
    }

    fn rebuild_index(&self) -> Result<(), EngineError> {
        let mut malformed = vec![];
        for kv in self.tree.iter(None, None) {
            let (key, value) = kv?;
            let stored_bytes = (key.len() + value.len()) as u64;

            let parsed = VersionedKey::read_from_bytes(&key)
                .map_err(|_| EngineError::CorruptEntry)
                .and_then(|k| {
                    Prefix::try_from(&k.prefix).map(|p| (p, k.version()))
                });
            let (prefix, version) = match parsed {
                Ok(p) => p,
                Err(_) => {
                    // A key that does not even name a prefix can only be
                    // dropped.
                    warn!("dropping malformed key of {} bytes", key.len());
                    self.counters.inc_quarantined();
                    malformed.push(key);
                    continue;
                }
            };

            let stored = match record::decode_meta(&value) {
                Ok(meta) => StoredVersion {
                    version,
                    tombstone: meta.tombstone,
                    written_at: meta.written_at,
                    stored_bytes,
                    quarantined: false,
                },
                Err(_) => {
                    warn!(
                        "quarantined corrupt version {} of {}",
                        version, prefix
                    );
                    self.counters.inc_quarantined();
                    StoredVersion {
                        version,
                        tombstone: false,
                        written_at: 0,
                        stored_bytes,
                        quarantined: true,
                    }
                }
            };

            let entry = self.index.get_or_insert(
                PrefixKey::from(&prefix),
                Mutex::new(VersionSet::new(prefix)),
            );
            let mut set = entry.value().lock();
            // The tree iterates in key order, so versions arrive oldest
            // first.
            set.versions.push(stored);
            if set.versions.len() > 1
                || stored.tombstone
                || stored.quarantined
            {
                self.mark_dirty(&prefix);
            }
            self.size_bytes.fetch_add(stored_bytes, Ordering::AcqRel);
        }

        if !malformed.is_empty() {
            for key in malformed {
                self.tree.remove(key, self.next_seqno());
            }
            self.close()?;
        }
        Ok(())
    }

    fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::AcqRel)
    }

    fn mark_dirty(&self, prefix: &Prefix) {
        self.dirty.lock().insert(PrefixKey::from(prefix).range_id());
    }

    //-------- Writes --------------------------------------------------------

    /// Append `entry` as a new version of its prefix. A tombstone is written
    /// for a withdrawal, see [delete](Self::delete).
    ///
    /// Writing a version number that is already stored replaces that
    /// version. Fails with [EngineError::StorageExhausted] if the entry
    /// does not fit in the byte budget, unless it is a tombstone.
    pub fn put(&self, entry: &RouteEntry) -> Result<(), EngineError> {
        let key = VersionedKey::new(&entry.prefix, entry.version);
        let written_at = now_ms();
        let value = record::encode(entry, written_at, self.compression);
        let stored_bytes = (VERSIONED_KEY_SIZE + value.len()) as u64;

        loop {
            let e = self.index.get_or_insert(
                key.prefix,
                Mutex::new(VersionSet::new(entry.prefix)),
            );
            let mut set = e.value().lock();
            if set.removed {
                continue;
            }

            let replaced = match set.position(entry.version) {
                Ok(i) => set.versions.get(i).map(|v| v.stored_bytes),
                Err(_) => None,
            };
            if !entry.tombstone {
                let reserved =
                    self.reserve_bytes(stored_bytes, replaced.unwrap_or(0));
                if let Err(err) = reserved {
                    if set.versions.is_empty() {
                        set.removed = true;
                        e.remove();
                    }
                    return Err(err);
                }
            } else {
                self.size_bytes.fetch_add(stored_bytes, Ordering::AcqRel);
                if let Some(old) = replaced {
                    self.size_bytes.fetch_sub(old, Ordering::AcqRel);
                }
            }

            self.tree.insert(key.as_bytes(), value, self.next_seqno());
            self.unsynced.store(true, Ordering::Release);

            let stored = StoredVersion {
                version: entry.version,
                tombstone: entry.tombstone,
                written_at,
                stored_bytes,
                quarantined: false,
            };
            match set.position(entry.version) {
                Ok(i) => {
                    if let Some(v) = set.versions.get_mut(i) {
                        *v = stored;
                    }
                }
                Err(i) => set.versions.insert(i, stored),
            }
            if set.versions.len() > 1 || entry.tombstone {
                self.mark_dirty(&entry.prefix);
            }
            trace!("disk tier put {}", entry);
            break;
        }

        if let Err(err) = self.after_write() {
            // A strict write that is not durable did not happen.
            self.remove_where(&entry.prefix, |v| {
                v.version == entry.version && v.written_at == written_at
            });
            return Err(err);
        }
        Ok(())
    }

    // Account for `add` more bytes, of which `release` replace bytes that
    // are already accounted for.
    fn reserve_bytes(
        &self,
        add: u64,
        release: u64,
    ) -> Result<(), EngineError> {
        let mut cur = self.size_bytes.load(Ordering::Acquire);
        loop {
            let new = (cur + add).saturating_sub(release);
            if let Some(max) = self.max_size_bytes {
                if new > max && add > release {
                    return Err(EngineError::StorageExhausted);
                }
            }
            match self.size_bytes.compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Write a tombstone with `version` for `prefix`.
    pub fn delete(
        &self,
        prefix: &Prefix,
        version: u64,
    ) -> Result<(), EngineError> {
        self.put(&RouteEntry::tombstone(*prefix, version))
    }

    /// Physically remove one stored version of `prefix`. Returns whether it
    /// was stored.
    pub fn remove_version(
        &self,
        prefix: &Prefix,
        version: u64,
    ) -> Result<bool, EngineError> {
        let removed = self.remove_where(prefix, |v| v.version == version);
        if removed.0 > 0 {
            self.after_write()?;
        }
        Ok(removed.0 > 0)
    }

    /// Physically remove all stored versions of `prefix`. Returns the
    /// number of bytes released.
    pub fn evict(&self, prefix: &Prefix) -> Result<u64, EngineError> {
        let (count, bytes) = self.remove_where(prefix, |_| true);
        if count > 0 {
            self.after_write()?;
        }
        Ok(bytes)
    }

    fn remove_where(
        &self,
        prefix: &Prefix,
        pred: impl Fn(&StoredVersion) -> bool,
    ) -> (usize, u64) {
        let Some(e) = self.index.get(&PrefixKey::from(prefix)) else {
            return (0, 0);
        };
        let mut set = e.value().lock();
        if set.removed {
            return (0, 0);
        }
        let removed = self.remove_versions(&mut set, pred);
        if set.versions.is_empty() {
            set.removed = true;
            e.remove();
        }
        removed
    }

    // Remove the matching versions from the tree and from `set`. The caller
    // holds the lock on `set`.
    fn remove_versions(
        &self,
        set: &mut VersionSet,
        pred: impl Fn(&StoredVersion) -> bool,
    ) -> (usize, u64) {
        let mut count = 0;
        let mut bytes = 0;
        let prefix = set.prefix;
        set.versions.retain(|v| {
            if !pred(v) {
                return true;
            }
            let key = VersionedKey::new(&prefix, v.version);
            self.tree.remove(key.as_bytes(), self.next_seqno());
            count += 1;
            bytes += v.stored_bytes;
            false
        });
        if count > 0 {
            self.size_bytes.fetch_sub(bytes, Ordering::AcqRel);
            self.unsynced.store(true, Ordering::Release);
            trace!("disk tier removed {} versions of {}", count, prefix);
        }
        (count, bytes)
    }

    fn after_write(&self) -> Result<(), EngineError> {
        match self.sync_mode {
            SyncMode::Strict => self.sync(),
            SyncMode::Normal | SyncMode::None => Ok(()),
        }
    }

    //-------- Reads ---------------------------------------------------------

    /// The newest version of `prefix`. Absent if the prefix is unknown, its
    /// newest version is a tombstone, or it is quarantined.
    pub fn get(
        &self,
        prefix: &Prefix,
    ) -> Result<Option<RouteEntry>, EngineError> {
        Ok(self.latest(prefix)?.filter(|e| !e.tombstone))
    }

    /// The newest version of `prefix`, tombstones included.
    pub fn latest(
        &self,
        prefix: &Prefix,
    ) -> Result<Option<RouteEntry>, EngineError> {
        let Some(e) = self.index.get(&PrefixKey::from(prefix)) else {
            return Ok(None);
        };
        let mut set = e.value().lock();
        let Some(newest) = set.newest().copied() else {
            return Ok(None);
        };
        if newest.quarantined {
            return Ok(None);
        }
        if newest.tombstone {
            return Ok(Some(RouteEntry::tombstone(
                set.prefix,
                newest.version,
            )));
        }

        match self.read_version(&set.prefix, newest.version) {
            Ok(entry) => Ok(Some(entry)),
            Err(EngineError::CorruptEntry) => {
                self.quarantine(&mut set, newest.version);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn read_version(
        &self,
        prefix: &Prefix,
        version: u64,
    ) -> Result<RouteEntry, EngineError> {
        let key = VersionedKey::new(prefix, version);
        let value = self
            .with_retry("read", || Ok(self.tree.get(key.as_bytes(), None)?))?
            // the version index says it's there
            .ok_or(EngineError::CorruptEntry)?;
        let (meta, payload) = record::decode_payload(&value)?;
        Ok(RouteEntry {
            prefix: *prefix,
            payload,
            version,
            tombstone: meta.tombstone,
        })
    }

    fn quarantine(&self, set: &mut VersionSet, version: u64) {
        if let Ok(i) = set.position(version) {
            if let Some(v) = set.versions.get_mut(i) {
                v.quarantined = true;
            }
        }
        warn!("quarantined corrupt version {} of {}", version, set.prefix);
        self.counters.inc_quarantined();
        self.mark_dirty(&set.prefix);
    }

    /// The newest stored version of `prefix` and whether it is a
    /// tombstone, without reading the value.
    pub fn newest_version(&self, prefix: &Prefix) -> Option<(u64, bool)> {
        let e = self.index.get(&PrefixKey::from(prefix))?;
        let set = e.value().lock();
        set.newest().map(|v| (v.version, v.tombstone))
    }

    #[cfg(test)]
    pub(crate) fn versions(&self, prefix: &Prefix) -> Vec<StoredVersion> {
        self.index
            .get(&PrefixKey::from(prefix))
            .map(|e| e.value().lock().versions.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn contains(&self, prefix: &Prefix) -> bool {
        self.newest_version(prefix).is_some_and(|(_, t)| !t)
    }

    /// All prefixes with at least one stored version, in prefix order.
    pub fn prefixes(&self) -> Vec<Prefix> {
        self.index.iter().map(|e| e.value().lock().prefix).collect()
    }

    /// The number of prefixes with at least one stored version.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes of all stored versions, as accounted against the byte budget.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    /// Bytes of the segment files on disk.
    pub fn disk_space(&self) -> u64 {
        self.tree.disk_space()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    //-------- Durability ----------------------------------------------------

    /// Make all writes so far durable, by flushing the active memtable into
    /// a segment. A successful sync clears the degraded state.
    pub fn sync(&self) -> Result<(), EngineError> {
        let _guard = self.flush_lock.lock();
        if !self.unsynced.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let res = self.with_retry("sync", || {
            if let Some(segment) = self.tree.flush_active_memtable(0)? {
                self.tree.register_segments(&[segment])?;
            }
            if self.needs_merge() {
                self.merge_segments()?;
            }
            Ok(())
        });
        match res {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!("disk tier at {} recovered", self.path.display());
                }
                Ok(())
            }
            Err(err) => {
                self.unsynced.store(true, Ordering::Release);
                Err(err)
            }
        }
    }

    // Run `op`, retrying I/O failures with exponential backoff and jitter.
    // When the retries are exhausted the tier is marked degraded.
    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut attempt = 0;
        let mut delay = self.retry.initial_delay_ms as f64;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(EngineError::IoFailure(e))
                    if attempt < self.retry.max_retries =>
                {
                    attempt += 1;
                    let jitter =
                        rand::rng().random_range(0..=(delay as u64 / 2));
                    warn!(
                        "disk {} failed (attempt {}): {}, retrying in {}ms",
                        what,
                        attempt,
                        e,
                        delay as u64 + jitter
                    );
                    std::thread::sleep(Duration::from_millis(
                        delay as u64 + jitter,
                    ));
                    delay = (delay * self.retry.backoff_multiplier)
                        .min(self.retry.max_delay_ms as f64);
                }
                Err(EngineError::IoFailure(e)) => {
                    error!(
                        "disk {} failed after {} attempts, disk tier at {} \
                        is degraded: {}",
                        what,
                        attempt + 1,
                        self.path.display(),
                        e
                    );
                    self.degraded.store(true, Ordering::Release);
                    return Err(EngineError::IoFailure(e));
                }
                Err(err) => return Err(err),
            }
        }
    }

    //-------- Compaction ----------------------------------------------------

    /// Take the set of dirty key ranges, leaving it empty. Writes that
    /// happen after this mark their ranges dirty again.
    pub(crate) fn take_dirty_ranges(&self) -> RoaringBitmap {
        std::mem::take(&mut *self.dirty.lock())
    }

    pub(crate) fn mark_range_dirty(&self, range: u32) {
        self.dirty.lock().insert(range);
    }

    #[cfg(test)]
    pub(crate) fn dirty_ranges(&self) -> RoaringBitmap {
        self.dirty.lock().clone()
    }

    /// The prefixes stored in each of `ranges`.
    pub(crate) fn prefixes_by_range(
        &self,
        ranges: &RoaringBitmap,
    ) -> BTreeMap<u32, Vec<Prefix>> {
        let mut res: BTreeMap<u32, Vec<Prefix>> = BTreeMap::new();
        for e in self.index.iter() {
            let range = e.key().range_id();
            if ranges.contains(range) {
                res.entry(range).or_default().push(e.value().lock().prefix);
            }
        }
        res
    }

    /// Discard all but the newest version of `prefix`, and all quarantined
    /// versions. If the newest version is a tombstone that is at least
    /// `retention_ms` old, or is quarantined, the prefix is removed
    /// altogether. Running this twice has the same effect as running it
    /// once.
    pub(crate) fn compact_prefix(
        &self,
        prefix: &Prefix,
        now: u64,
        retention_ms: u64,
    ) -> PrefixCompaction {
        let Some(e) = self.index.get(&PrefixKey::from(prefix)) else {
            return PrefixCompaction::default();
        };
        let mut set = e.value().lock();
        let Some(newest) = set.newest().copied() else {
            return PrefixCompaction::default();
        };

        let expired = newest.tombstone
            && now.saturating_sub(newest.written_at) >= retention_ms;
        let (removed_versions, reclaimed_bytes) =
            if expired || newest.quarantined {
                self.remove_versions(&mut set, |_| true)
            } else {
                self.remove_versions(&mut set, |v| {
                    v.version != newest.version || v.quarantined
                })
            };

        let gone = if set.versions.is_empty() {
            set.removed = true;
            e.remove();
            Some(newest.version)
        } else {
            None
        };

        if removed_versions > 0 {
            debug!(
                "compacted {}: removed {} versions, {} bytes",
                prefix, removed_versions, reclaimed_bytes
            );
        }

        PrefixCompaction {
            removed_versions,
            reclaimed_bytes,
            gone,
            pending: newest.tombstone && !expired,
        }
    }

    /// Whether the tree holds enough segments to be worth merging.
    pub(crate) fn needs_merge(&self) -> bool {
        self.tree.segment_count() > MAX_SEGMENTS
    }

    fn merge_segments(&self) -> Result<(), EngineError> {
        let seqno = self.seqno.load(Ordering::Acquire);
        self.tree.compact(
            Arc::new(lsm_tree::compaction::Leveled::default()),
            seqno,
        )?;
        Ok(())
    }

    /// Make the removals of a compaction pass durable, and let the tree
    /// reclaim the space they held.
    pub(crate) fn reclaim(&self) -> Result<(), EngineError> {
        self.sync()?;
        self.with_retry("compact", || self.merge_segments())
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.tree.segment_count()
    }

    /// Flush everything, regardless of the sync mode. Used on shutdown.
    pub fn close(&self) -> Result<(), EngineError> {
        self.unsynced.store(true, Ordering::Release);
        self.sync()
    }
}

#[cfg(test)]
mod tests;
