//------------ Migration -----------------------------------------------------

//! Moving entries between the memory and the disk tier.
//!
//! Migration runs in batches. Candidates are selected by asking the
//! placement policy about every indexed entry, least recently used first
//! for demotion and most recently used first for promotion, with the prefix
//! order breaking ties. A batch then goes through three phases:
//!
//! 1. copy: for each task, under the prefix's lock, read the entry from the
//!    source tier and write it to the target tier;
//! 2. sync: make the copies on disk durable, once for the whole batch;
//! 3. commit: for each task, under the prefix's lock, check that the entry
//!    has not changed since it was copied, point the location index at the
//!    target, remove the source copy and invalidate the cache.
//!
//! Until the commit, readers see the source copy, after it they see the
//! target copy. A task that fails at any step has its target copy removed
//! and is retried by a later batch, up to a maximum number of attempts.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use inetnum::addr::Prefix;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::errors::EngineError;
use crate::placement::{EntryMeta, PlacementPolicy};
use crate::rib::index::IndexSlot;
use crate::rib::tiered_rib::RibState;
use crate::stats::Operation;
use crate::types::prefix_key::PrefixKey;
use crate::types::{now_ms, TierLocation};

/// The number of times a task is tried before it is dropped.
pub const MAX_ATTEMPTS: u32 = 5;

// How long migration waits for a prefix lock held by a writer.
const LOCK_TIMEOUT: Duration = Duration::from_millis(50);

//------------ MigrationState ------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MigrationState {
    /// Waiting for the next batch.
    Pending,
    /// Copied to the target tier, not yet committed.
    InFlight,
    Committed,
    Failed,
}

//------------ MigrationTask -------------------------------------------------

/// The move of one prefix from one tier to the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationTask {
    pub prefix: Prefix,
    pub from: TierLocation,
    pub to: TierLocation,
    /// The version that was copied. Zero until the copy phase ran.
    pub version: u64,
    pub attempts: u32,
    pub state: MigrationState,
}

impl MigrationTask {
    fn new(prefix: Prefix, from: TierLocation) -> Self {
        Self {
            prefix,
            from,
            to: from.other(),
            version: 0,
            attempts: 0,
            state: MigrationState::Pending,
        }
    }
}

//------------ MigrationTrigger ----------------------------------------------

/// What started a migration run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MigrationTrigger {
    /// The memory tier reached its threshold. Only demotes.
    Threshold,
    /// The periodic tick, or an explicit request. Demotes and promotes.
    Tick,
}

//------------ MigrationReport -----------------------------------------------

/// The outcome of one migration run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub demoted: usize,
    pub promoted: usize,
    pub failed: usize,
    /// Tasks waiting for a retry after this run.
    pub queue_depth: usize,
}

// Why a step of a task did not go through.
#[derive(Debug)]
enum StepError {
    // The prefix lock could not be had in time.
    Busy,
    // The entry changed since the task was planned or copied.
    Stale,
    Engine(EngineError),
}

impl From<EngineError> for StepError {
    fn from(value: EngineError) -> Self {
        StepError::Engine(value)
    }
}

//------------ MigrationCoordinator ------------------------------------------

#[derive(Debug)]
pub(crate) struct MigrationCoordinator {
    batch_size: usize,
    // failed tasks, waiting for the next run
    queue: Mutex<VecDeque<MigrationTask>>,
    // copied tasks of the current run, not yet committed or rolled back
    in_flight: Mutex<Vec<MigrationTask>>,
    running: Mutex<()>,
}

impl MigrationCoordinator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            running: Mutex::new(()),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// Roll back and requeue tasks that a previous run left in flight, for
    /// instance because its thread panicked between copy and commit.
    ///
    /// The tasks of a run in progress are in flight legitimately. So this
    /// waits for such a run to finish if `wait` is set, and otherwise does
    /// nothing, leaving it to the next run.
    pub fn recover(&self, rib: &RibState, wait: bool) {
        let _running = if wait {
            self.running.lock()
        } else if let Some(running) = self.running.try_lock() {
            running
        } else {
            trace!("migration running, nothing to recover");
            return;
        };
        self.recover_stranded(rib);
    }

    // The caller holds `running`.
    fn recover_stranded(&self, rib: &RibState) {
        let stranded = std::mem::take(&mut *self.in_flight.lock());
        if stranded.is_empty() {
            return;
        }
        warn!("recovering {} in-flight migration tasks", stranded.len());
        for mut task in stranded {
            self.rollback(rib, &task);
            task.state = MigrationState::Failed;
            self.requeue(rib, task, "stranded in flight");
        }
    }

    /// Run one batch. If another run is in progress, wait for it to finish
    /// if `wait` is set, or return an empty report. Also returns an empty
    /// report if the RIB has no placement policy, i.e. it is not hybrid.
    pub fn run(
        &self,
        rib: &RibState,
        trigger: MigrationTrigger,
        cancel: &AtomicBool,
        wait: bool,
    ) -> MigrationReport {
        let _running = if wait {
            self.running.lock()
        } else if let Some(running) = self.running.try_lock() {
            running
        } else {
            trace!("migration already running");
            return MigrationReport {
                queue_depth: self.queue_depth(),
                ..Default::default()
            };
        };
        let Some(policy) = rib.policy.as_deref() else {
            return MigrationReport::default();
        };
        self.recover_stranded(rib);

        let mut report = MigrationReport::default();
        let batch = self.plan(rib, policy, trigger);
        if !batch.is_empty() {
            debug!("migration batch of {} tasks ({:?})", batch.len(), trigger);
        }

        // copy
        let mut copied = Vec::with_capacity(batch.len());
        for mut task in batch {
            if cancel.load(Ordering::Acquire) {
                // Not started, so not an attempt.
                self.queue.lock().push_back(task);
                continue;
            }
            match self.copy(rib, &mut task) {
                Ok(true) => {
                    task.state = MigrationState::InFlight;
                    self.in_flight.lock().push(task.clone());
                    copied.push(task);
                }
                Ok(false) => {
                    trace!("migration of {} no longer needed", task.prefix);
                }
                Err(err) => {
                    self.fail(rib, task, err);
                    report.failed += 1;
                }
            }
        }

        // sync
        if copied.iter().any(|t| t.to == TierLocation::Disk) {
            if let Some(Err(err)) = rib.backend.disk().map(|d| d.sync()) {
                for task in copied.drain(..) {
                    self.rollback(rib, &task);
                    self.forget(&task);
                    self.fail(rib, task, StepError::Engine(err.clone()));
                    report.failed += 1;
                }
            }
        }

        // commit
        for mut task in copied {
            let res = if cancel.load(Ordering::Acquire) {
                Err(StepError::Busy)
            } else {
                self.commit(rib, &task)
            };
            match res {
                Ok(()) => {
                    task.state = MigrationState::Committed;
                    rib.counters.inc_migrations_committed();
                    match task.to {
                        TierLocation::Disk => report.demoted += 1,
                        TierLocation::Memory => report.promoted += 1,
                    }
                    trace!(
                        "migrated {} v{} from {} to {}",
                        task.prefix,
                        task.version,
                        task.from,
                        task.to
                    );
                }
                Err(err) => {
                    self.rollback(rib, &task);
                    self.fail(rib, task.clone(), err);
                    report.failed += 1;
                }
            }
            self.forget(&task);
        }

        report.queue_depth = self.queue_depth();
        rib.counters.set_migration_queue_depth(report.queue_depth);
        if report.demoted + report.promoted + report.failed > 0 {
            info!(
                "migration: {} demoted, {} promoted, {} failed, {} queued",
                report.demoted,
                report.promoted,
                report.failed,
                report.queue_depth
            );
        }
        report
    }

    // Select the tasks for the next batch: queued retries first, then
    // demotions, then, except for threshold runs, promotions.
    fn plan(
        &self,
        rib: &RibState,
        policy: &dyn PlacementPolicy,
        trigger: MigrationTrigger,
    ) -> Vec<MigrationTask> {
        let now = now_ms();
        let mut memory_len =
            rib.backend.memory().map(|m| m.size()).unwrap_or(0);
        let mut batch = Vec::new();
        let mut planned = BTreeSet::new();

        let retries = std::mem::take(&mut *self.queue.lock());
        for mut task in retries {
            let still_there = rib.index.get(&task.prefix).is_some_and(|s| {
                !s.is_tombstone() && s.tier() == task.from
            });
            if !still_there {
                continue;
            }
            if batch.len() >= self.batch_size {
                self.queue.lock().push_back(task);
                continue;
            }
            task.state = MigrationState::Pending;
            task.version = 0;
            memory_len = project(memory_len, task.to);
            planned.insert(PrefixKey::from(&task.prefix));
            batch.push(task);
        }

        let candidates = |tier: TierLocation| {
            let mut slots = rib
                .index
                .slots()
                .filter(|s| !s.is_tombstone() && s.tier() == tier)
                .map(|s| (s.last_access(), PrefixKey::from(&s.prefix()), s))
                .filter(|(_, key, _)| !planned.contains(key))
                .collect::<Vec<_>>();
            match tier {
                TierLocation::Memory => {
                    slots.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)))
                }
                TierLocation::Disk => {
                    slots.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)))
                }
            }
            slots.into_iter().map(|(_, _, s)| s).collect::<Vec<_>>()
        };

        let demotions = candidates(TierLocation::Memory);
        let promotions = match trigger {
            MigrationTrigger::Threshold => vec![],
            MigrationTrigger::Tick => candidates(TierLocation::Disk),
        };

        for slot in demotions.iter().chain(promotions.iter()) {
            if batch.len() >= self.batch_size {
                break;
            }
            let tiers = rib.tier_state(memory_len, now);
            let from = slot.tier();
            if policy.place(&entry_meta(slot), &tiers) != from {
                memory_len = project(memory_len, from.other());
                batch.push(MigrationTask::new(slot.prefix(), from));
            }
        }

        batch
    }

    // Copy the entry to the target tier. Returns false if there is nothing
    // to copy anymore.
    fn copy(
        &self,
        rib: &RibState,
        task: &mut MigrationTask,
    ) -> Result<bool, StepError> {
        let _guard = rib
            .locks
            .try_lock_for(&task.prefix, LOCK_TIMEOUT)
            .ok_or(StepError::Busy)?;
        let Some(slot) = rib.index.get(&task.prefix) else {
            return Ok(false);
        };
        if slot.is_tombstone() || slot.tier() != task.from {
            return Ok(false);
        }
        let Some(entry) = rib.backend.read(task.from, &task.prefix)? else {
            return Ok(false);
        };
        if entry.version != slot.version() {
            return Err(StepError::Stale);
        }
        rib.backend.write(task.to, &entry)?;
        task.version = entry.version;
        Ok(true)
    }

    fn commit(
        &self,
        rib: &RibState,
        task: &MigrationTask,
    ) -> Result<(), StepError> {
        let _guard = rib
            .locks
            .try_lock_for(&task.prefix, LOCK_TIMEOUT)
            .ok_or(StepError::Busy)?;
        let slot = rib.index.get(&task.prefix).ok_or(StepError::Stale)?;
        if slot.is_tombstone()
            || slot.tier() != task.from
            || slot.version() != task.version
        {
            return Err(StepError::Stale);
        }
        // The target copy must still be there to take over.
        let copied = rib.backend.read(task.to, &task.prefix)?;
        if !copied.is_some_and(|e| e.version == task.version) {
            return Err(StepError::Stale);
        }

        slot.set_tier(task.to);
        if let Err(err) = rib.backend.remove(task.from, &task.prefix) {
            // The index no longer points at it, compaction or the next
            // write of the prefix takes care of the leftover.
            warn!(
                "could not remove {} from the {} tier: {}",
                task.prefix, task.from, err
            );
        }
        rib.backend.invalidate(&task.prefix);
        Ok(())
    }

    // Remove the target copy of a task, unless the index points at it.
    fn rollback(&self, rib: &RibState, task: &MigrationTask) {
        if task.version == 0 {
            return;
        }
        let _guard = rib.locks.lock(&task.prefix);
        let committed = rib.index.get(&task.prefix).is_some_and(|s| {
            !s.is_tombstone()
                && s.tier() == task.to
                && s.version() == task.version
        });
        if committed {
            return;
        }
        if let Err(err) =
            rib.backend.remove_version(task.to, &task.prefix, task.version)
        {
            warn!(
                "could not roll back migration of {} to the {} tier: {}",
                task.prefix, task.to, err
            );
        }
    }

    fn forget(&self, task: &MigrationTask) {
        self.in_flight.lock().retain(|t| t.prefix != task.prefix);
    }

    fn fail(&self, rib: &RibState, mut task: MigrationTask, err: StepError) {
        rib.counters.inc_migrations_failed();
        let reason = match err {
            StepError::Busy => "prefix busy".to_string(),
            StepError::Stale => "entry changed".to_string(),
            StepError::Engine(err) => {
                rib.counters.inc_error(Operation::Migration, &err);
                err.to_string()
            }
        };
        task.state = MigrationState::Failed;
        self.requeue(rib, task, &reason);
    }

    fn requeue(&self, rib: &RibState, mut task: MigrationTask, reason: &str) {
        task.attempts += 1;
        if task.attempts >= MAX_ATTEMPTS {
            warn!(
                "giving up migration of {} to the {} tier after {} \
                attempts: {}",
                task.prefix, task.to, task.attempts, reason
            );
            return;
        }
        debug!(
            "migration of {} to the {} tier failed (attempt {}): {}",
            task.prefix, task.to, task.attempts, reason
        );
        task.state = MigrationState::Pending;
        task.version = 0;
        self.queue.lock().push_back(task);
        rib.counters.set_migration_queue_depth(self.queue_depth());
    }

    #[cfg(test)]
    pub(crate) fn strand(&self, task: MigrationTask) {
        self.in_flight.lock().push(task);
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.running.lock()
    }

    #[cfg(test)]
    pub(crate) fn try_commit(
        &self,
        rib: &RibState,
        task: &MigrationTask,
    ) -> bool {
        self.commit(rib, task).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> Vec<MigrationTask> {
        self.queue.lock().iter().cloned().collect()
    }
}

// The memory size after a move to `to`.
fn project(memory_len: usize, to: TierLocation) -> usize {
    match to {
        TierLocation::Memory => memory_len + 1,
        TierLocation::Disk => memory_len.saturating_sub(1),
    }
}

fn entry_meta(slot: &IndexSlot) -> EntryMeta {
    EntryMeta {
        current: Some(slot.tier()),
        last_access: slot.last_access(),
        access_count: slot.access_count(),
        size: slot.size(),
    }
}
