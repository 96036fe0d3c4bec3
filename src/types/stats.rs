//------------ Types for Statistics -----------------------------------------

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde_derive::Serialize;

use crate::errors::{EngineError, ErrorKind};

//------------ Operation -----------------------------------------------------

/// The operations error counts are kept for. The first three are the public
/// API of the engine, the next two are the background workers. `Shutdown`
/// counts entries that could not be written to disk on shutdown.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Apply,
    Get,
    LongestMatch,
    Migration,
    Compaction,
    Shutdown,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Apply,
        Operation::Get,
        Operation::LongestMatch,
        Operation::Migration,
        Operation::Compaction,
        Operation::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Get => "get",
            Operation::LongestMatch => "longest_match",
            Operation::Migration => "migration",
            Operation::Compaction => "compaction",
            Operation::Shutdown => "shutdown",
        }
    }

    fn index(&self) -> usize {
        match self {
            Operation::Apply => 0,
            Operation::Get => 1,
            Operation::LongestMatch => 2,
            Operation::Migration => 3,
            Operation::Compaction => 4,
            Operation::Shutdown => 5,
        }
    }
}

//------------ Counters -----------------------------------------------------
//
// This is the struct that is shared between the router, the tiers and the
// background workers. All counters are relaxed atomics: they are only ever
// read to report.

#[derive(Debug, Default)]
pub(crate) struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    // number of migration tasks waiting for the next tick
    migration_queue_depth: AtomicUsize,
    migrations_committed: AtomicU64,
    migrations_failed: AtomicU64,
    compaction_runs: AtomicU64,
    last_compaction_ms: AtomicU64,
    total_compaction_ms: AtomicU64,
    compaction_reclaimed_bytes: AtomicU64,
    quarantined: AtomicU64,
    // indexed by [Operation][ErrorKind]
    errors: [[AtomicU64; 5]; 6],
}

impl Counters {
    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn set_migration_queue_depth(&self, depth: usize) {
        self.migration_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn migration_queue_depth(&self) -> usize {
        self.migration_queue_depth.load(Ordering::Relaxed)
    }

    pub fn inc_migrations_committed(&self) {
        self.migrations_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_migrations_failed(&self) {
        self.migrations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self, duration_ms: u64, reclaimed_bytes: u64) {
        self.compaction_runs.fetch_add(1, Ordering::Relaxed);
        self.last_compaction_ms.store(duration_ms, Ordering::Relaxed);
        self.total_compaction_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.compaction_reclaimed_bytes
            .fetch_add(reclaimed_bytes, Ordering::Relaxed);
    }

    pub fn inc_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn quarantined(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    pub fn inc_error(&self, op: Operation, err: &EngineError) {
        if let Some(c) = self
            .errors
            .get(op.index())
            .and_then(|row| row.get(err.kind().index()))
        {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn error_count(&self, op: Operation, kind: ErrorKind) -> u64 {
        self.errors
            .get(op.index())
            .and_then(|row| row.get(kind.index()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn error_counts(&self) -> Vec<ErrorCount> {
        Operation::ALL
            .iter()
            .flat_map(|op| {
                ErrorKind::ALL.iter().filter_map(move |kind| {
                    let count = self.error_count(*op, *kind);
                    if count != 0 {
                        Some(ErrorCount {
                            operation: op.as_str(),
                            kind: kind.as_str(),
                            count,
                        })
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    pub(crate) fn snapshot(&self, tiers: TierUsage) -> EngineStats {
        let hits = self.cache_hits();
        let misses = self.cache_misses();
        EngineStats {
            storage_type: tiers.storage_type,
            memory_entries: tiers.memory_entries,
            memory_threshold: tiers.memory_threshold,
            disk_usage_bytes: tiers.disk_usage_bytes,
            disk_space_bytes: tiers.disk_space_bytes,
            disk_degraded: tiers.disk_degraded,
            indexed_prefixes: tiers.indexed_prefixes,
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            migration_queue_depth: self.migration_queue_depth(),
            migrations_committed: self
                .migrations_committed
                .load(Ordering::Relaxed),
            migrations_failed: self.migrations_failed.load(Ordering::Relaxed),
            compaction_runs: self.compaction_runs.load(Ordering::Relaxed),
            last_compaction_duration_ms: self
                .last_compaction_ms
                .load(Ordering::Relaxed),
            total_compaction_duration_ms: self
                .total_compaction_ms
                .load(Ordering::Relaxed),
            compaction_reclaimed_bytes: self
                .compaction_reclaimed_bytes
                .load(Ordering::Relaxed),
            quarantined_entries: self.quarantined(),
            errors: self.error_counts(),
        }
    }
}

// Occupancy of the tiers, gathered by the router when a snapshot is taken.
pub(crate) struct TierUsage {
    pub storage_type: &'static str,
    pub memory_entries: usize,
    pub memory_threshold: usize,
    pub disk_usage_bytes: u64,
    pub disk_space_bytes: u64,
    pub disk_degraded: bool,
    pub indexed_prefixes: usize,
}

//------------ ErrorCount ----------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub operation: &'static str,
    pub kind: &'static str,
    pub count: u64,
}

//------------ EngineStats ---------------------------------------------------

/// A point-in-time snapshot of the engine's counters, meant to be picked up
/// by an external metrics collector.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub storage_type: &'static str,
    pub memory_entries: usize,
    pub memory_threshold: usize,
    /// Bytes of all retained versions on disk, as accounted against
    /// `max_size_bytes`.
    pub disk_usage_bytes: u64,
    /// Bytes of the segment files of the disk tier.
    pub disk_space_bytes: u64,
    pub disk_degraded: bool,
    pub indexed_prefixes: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub migration_queue_depth: usize,
    pub migrations_committed: u64,
    pub migrations_failed: u64,
    pub compaction_runs: u64,
    pub last_compaction_duration_ms: u64,
    pub total_compaction_duration_ms: u64,
    pub compaction_reclaimed_bytes: u64,
    pub quarantined_entries: u64,
    pub errors: Vec<ErrorCount>,
}

impl EngineStats {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "storage type:\t\t{}", self.storage_type)?;
        writeln!(
            f,
            "memory entries:\t\t{} (threshold {})",
            self.memory_entries, self.memory_threshold
        )?;
        writeln!(f, "disk usage:\t\t{} bytes", self.disk_usage_bytes)?;
        writeln!(f, "disk space:\t\t{} bytes", self.disk_space_bytes)?;
        if self.disk_degraded {
            writeln!(f, "disk tier is DEGRADED")?;
        }
        writeln!(f, "indexed prefixes:\t{}", self.indexed_prefixes)?;
        writeln!(
            f,
            "cache hit rate:\t\t{:.3} ({} hits, {} misses)",
            self.cache_hit_rate, self.cache_hits, self.cache_misses
        )?;
        writeln!(
            f,
            "migrations:\t\t{} committed, {} failed, {} queued",
            self.migrations_committed,
            self.migrations_failed,
            self.migration_queue_depth
        )?;
        writeln!(
            f,
            "compactions:\t\t{} runs, last {}ms, {} bytes reclaimed",
            self.compaction_runs,
            self.last_compaction_duration_ms,
            self.compaction_reclaimed_bytes
        )?;
        writeln!(f, "quarantined entries:\t{}", self.quarantined_entries)?;
        for e in &self.errors {
            writeln!(f, "errors {}/{}:\t{}", e.operation, e.kind, e.count)?;
        }
        Ok(())
    }
}
