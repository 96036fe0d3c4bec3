//------------ Compaction ----------------------------------------------------

//! Reclaiming disk space.
//!
//! The disk tier keeps track of the key ranges that hold superseded
//! versions, tombstones or quarantined versions. A compaction pass turns
//! each of these dirty ranges into a [CompactionTask], and for every prefix
//! in the range keeps only the newest version. Prefixes whose newest version
//! is a tombstone older than the retention window are removed altogether,
//! from the disk tier and from the location index.
//!
//! Each prefix is compacted under its lock, so a pass can be cancelled
//! between any two prefixes and simply be run again later: compacting a
//! prefix twice has the same effect as compacting it once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info};
use parking_lot::Mutex;

use crate::errors::EngineError;
use crate::rib::tiered_rib::RibState;
use crate::types::{now_ms, TierLocation};

//------------ CompactionState -----------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompactionState {
    Scheduled,
    Running,
    Done,
    /// Cancelled before it finished. The range stays dirty.
    Aborted,
}

//------------ CompactionTask ------------------------------------------------

/// The compaction of one key range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionTask {
    pub range: u32,
    pub state: CompactionState,
    pub removed_versions: usize,
    pub removed_prefixes: usize,
    pub reclaimed_bytes: u64,
}

impl CompactionTask {
    fn new(range: u32) -> Self {
        Self {
            range,
            state: CompactionState::Scheduled,
            removed_versions: 0,
            removed_prefixes: 0,
            reclaimed_bytes: 0,
        }
    }
}

//------------ CompactionReport ----------------------------------------------

/// The outcome of one compaction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub tasks: Vec<CompactionTask>,
    pub duration_ms: u64,
}

impl CompactionReport {
    pub fn removed_versions(&self) -> usize {
        self.tasks.iter().map(|t| t.removed_versions).sum()
    }

    pub fn removed_prefixes(&self) -> usize {
        self.tasks.iter().map(|t| t.removed_prefixes).sum()
    }

    pub fn reclaimed_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.reclaimed_bytes).sum()
    }

    /// Whether every scheduled range was compacted.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.state == CompactionState::Done)
    }
}

//------------ Compactor -----------------------------------------------------

#[derive(Debug)]
pub(crate) struct Compactor {
    retention_ms: u64,
    running: Mutex<()>,
}

impl Compactor {
    pub fn new(tombstone_retention_secs: u64) -> Self {
        Self {
            retention_ms: tombstone_retention_secs.saturating_mul(1000),
            running: Mutex::new(()),
        }
    }

    /// Run one pass over the dirty ranges. If another pass is in progress,
    /// wait for it if `wait` is set, or return an empty report. Also returns
    /// an empty report if the RIB has no disk tier.
    pub fn run(
        &self,
        rib: &RibState,
        cancel: &AtomicBool,
        wait: bool,
    ) -> Result<CompactionReport, EngineError> {
        let Some(disk) = rib.backend.disk() else {
            return Ok(CompactionReport::default());
        };
        let _running = if wait {
            self.running.lock()
        } else if let Some(running) = self.running.try_lock() {
            running
        } else {
            debug!("compaction already running");
            return Ok(CompactionReport::default());
        };

        let start = Instant::now();
        let now = now_ms();
        let ranges = disk.take_dirty_ranges();
        let prefixes = disk.prefixes_by_range(&ranges);
        let mut tasks =
            ranges.iter().map(CompactionTask::new).collect::<Vec<_>>();

        for task in tasks.iter_mut() {
            if cancel.load(Ordering::Acquire) {
                task.state = CompactionState::Aborted;
                disk.mark_range_dirty(task.range);
                continue;
            }
            task.state = CompactionState::Running;

            let mut pending = false;
            for prefix in prefixes.get(&task.range).into_iter().flatten() {
                if cancel.load(Ordering::Acquire) {
                    task.state = CompactionState::Aborted;
                    break;
                }
                let _guard = rib.locks.lock(prefix);
                let res = disk.compact_prefix(prefix, now, self.retention_ms);
                task.removed_versions += res.removed_versions;
                task.reclaimed_bytes += res.reclaimed_bytes;
                pending |= res.pending;

                if let Some(version) = res.gone {
                    // Only if the index still records what compaction
                    // removed.
                    if rib.index.remove_if(prefix, |s| {
                        s.tier() == TierLocation::Disk
                            && s.version() == version
                    }) {
                        task.removed_prefixes += 1;
                    }
                    rib.backend.invalidate(prefix);
                }
            }

            if task.state == CompactionState::Running {
                task.state = CompactionState::Done;
                if pending {
                    disk.mark_range_dirty(task.range);
                }
            } else {
                disk.mark_range_dirty(task.range);
            }
        }

        let mut report = CompactionReport {
            tasks,
            duration_ms: 0,
        };
        let res = if report.removed_versions() > 0 || disk.needs_merge() {
            disk.reclaim()
        } else {
            Ok(())
        };
        report.duration_ms = start.elapsed().as_millis() as u64;
        rib.counters
            .record_compaction(report.duration_ms, report.reclaimed_bytes());

        if !report.tasks.is_empty() {
            info!(
                "compaction of {} ranges in {}ms: removed {} versions, {} \
                prefixes, {} bytes",
                report.tasks.len(),
                report.duration_ms,
                report.removed_versions(),
                report.removed_prefixes(),
                report.reclaimed_bytes()
            );
        }
        res.map(|_| report)
    }
}
