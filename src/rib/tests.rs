use std::error::Error;
use std::str::FromStr;

use inetnum::addr::Prefix;

use crate::errors::{EngineError, ErrorKind};
use crate::placement::{EntryMeta, PlacementPolicy, TierState};
use crate::rib::config::{
    DiskStorageConfig, HybridStorageConfig, MemoryConfig, PlacementStrategy,
    StorageConfig, SyncMode,
};
use crate::rib::migration::{MigrationState, MigrationTask};
use crate::rib::TieredRib;
use crate::stats::Operation;
use crate::types::{Payload, RouteEntry, RouteOperation, TierLocation};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn disk(dir: &tempfile::TempDir) -> DiskStorageConfig {
    let mut disk = DiskStorageConfig::new(dir.path());
    disk.sync_mode = SyncMode::None;
    disk
}

fn hybrid(
    dir: &tempfile::TempDir,
    threshold: usize,
    low_watermark: f64,
) -> HybridStorageConfig {
    let mut config = HybridStorageConfig::new(disk(dir));
    config.memory_threshold = threshold;
    config.migration_low_watermark = low_watermark;
    config.auto_migration = false;
    config
}

fn pfx(s: &str) -> Prefix {
    Prefix::from_str(s).unwrap()
}

#[test]
fn stranded_tasks_are_rolled_back_and_retried() -> Result<(), Box<dyn Error>>
{
    init();
    let dir = tempfile::tempdir()?;
    let rib = TieredRib::new_with_config(StorageConfig::Hybrid(hybrid(
        &dir, 16, 0.5,
    )))?;
    let prefix = pfx("10.0.0.0/24");
    rib.apply(prefix, RouteOperation::Insert, "P1")?;
    assert_eq!(rib.location(&prefix), Some(TierLocation::Memory));

    // A demotion that copied the entry, and then lost its thread.
    let state = rib.state();
    let disk = state.backend.disk().unwrap();
    disk.put(&RouteEntry::new(prefix, Payload::from("P1"), 1))?;
    state.migration.strand(MigrationTask {
        prefix,
        from: TierLocation::Memory,
        to: TierLocation::Disk,
        version: 1,
        attempts: 0,
        state: MigrationState::InFlight,
    });

    state.migration.recover(state, true);
    assert!(disk.versions(&prefix).is_empty());
    let queued = state.migration.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempts, 1);
    assert_eq!(queued[0].state, MigrationState::Pending);

    assert_eq!(rib.location(&prefix), Some(TierLocation::Memory));
    let entry = rib.get(&prefix)?.unwrap();
    assert_eq!(entry.payload, Payload::from("P1"));
    assert_eq!(entry.version, 1);

    Ok(())
}

#[test]
fn demotion_settles_at_low_watermark() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let rib = TieredRib::new_with_config(StorageConfig::Hybrid(hybrid(
        &dir, 4, 0.5,
    )))?;
    let prefixes =
        ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.3.0/24"].map(pfx);
    for p in prefixes {
        rib.insert(p, "P1")?;
    }

    // The threshold run may already have done the work.
    rib.run_migration();
    let state = rib.state();
    assert_eq!(state.backend.memory().unwrap().size(), 2);
    assert_eq!(state.backend.disk().unwrap().len(), 2);

    let mut on_disk = 0;
    for p in prefixes {
        let entry = rib.get(&p)?.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.payload, Payload::from("P1"));
        if rib.location(&p) == Some(TierLocation::Disk) {
            on_disk += 1;
        }
    }
    assert_eq!(on_disk, 2);
    assert_eq!(rib.stats().migrations_failed, 0);

    Ok(())
}

#[test]
fn writes_to_full_memory_go_to_disk() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    // With the low watermark at the threshold nothing is demoted.
    let rib = TieredRib::new_with_config(StorageConfig::Hybrid(hybrid(
        &dir, 2, 1.0,
    )))?;
    let a = pfx("10.0.0.0/24");
    let b = pfx("10.0.1.0/24");
    let c = pfx("10.0.2.0/24");
    rib.insert(a, "A")?;
    rib.insert(b, "B")?;
    rib.insert(c, "C")?;

    assert_eq!(rib.location(&a), Some(TierLocation::Memory));
    assert_eq!(rib.location(&b), Some(TierLocation::Memory));
    assert_eq!(rib.location(&c), Some(TierLocation::Disk));

    // An update stays where the entry is.
    assert_eq!(rib.insert(a, "A2")?, 2);
    assert_eq!(rib.location(&a), Some(TierLocation::Memory));
    assert_eq!(rib.state().backend.memory().unwrap().size(), 2);

    Ok(())
}

#[test]
fn stale_cache_entries_are_not_served() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let rib = TieredRib::new_with_config(StorageConfig::Disk(disk(&dir)))?;
    let prefix = pfx("192.0.2.0/24");

    rib.insert(prefix, "P1")?;
    assert_eq!(rib.get(&prefix)?.unwrap().version, 1);
    assert_eq!(rib.get(&prefix)?.unwrap().version, 1);
    assert_eq!(rib.stats().cache_hits, 1);

    rib.insert(prefix, "P2")?;
    // A population that lost the race with the invalidation.
    let cache = rib.state().backend.cache().unwrap();
    cache.populate(&RouteEntry::new(prefix, Payload::from("P1"), 1));

    let entry = rib.get(&prefix)?.unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.payload, Payload::from("P2"));

    Ok(())
}

#[test]
fn compaction_forgets_expired_withdrawals() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let mut config = disk(&dir);
    config.tombstone_retention_secs = 0;
    let rib = TieredRib::new_with_config(StorageConfig::Disk(config))?;
    let prefix = pfx("10.0.0.0/24");

    rib.insert(prefix, "P1")?;
    rib.insert(prefix, "P2")?;
    assert_eq!(rib.withdraw_prefix(prefix)?, 3);
    assert_eq!(rib.withdraw_prefix(prefix)?, 3);
    assert_eq!(rib.get(&prefix)?, None);

    let report = rib.run_compaction()?;
    assert!(report.is_complete());
    assert_eq!(report.removed_versions(), 3);
    assert_eq!(report.removed_prefixes(), 1);
    assert!(rib.state().index.get(&prefix).is_none());
    assert!(rib.state().backend.disk().unwrap().is_empty());

    // Nothing is left of the prefix, so it starts over.
    assert_eq!(rib.insert(prefix, "P3")?, 1);

    let again = rib.run_compaction()?;
    assert_eq!(again.removed_versions(), 0);

    Ok(())
}

#[test]
fn memory_withdrawals_forget_the_prefix() -> Result<(), Box<dyn Error>> {
    init();
    let rib = TieredRib::try_default()?;
    let prefix = pfx("2001:db8::/32");

    assert_eq!(rib.withdraw_prefix(prefix)?, 0);
    rib.insert(prefix, "P1")?;
    assert_eq!(rib.withdraw_prefix(prefix)?, 2);
    assert!(!rib.contains(&prefix));
    assert_eq!(rib.stats().indexed_prefixes, 0);
    assert_eq!(rib.insert(prefix, "P2")?, 1);

    Ok(())
}

#[test]
fn bounded_memory_rejects_writes() -> Result<(), Box<dyn Error>> {
    init();
    let rib = TieredRib::new_with_config(StorageConfig::Memory(MemoryConfig {
        max_entries: Some(1),
    }))?;
    rib.insert(pfx("10.0.0.0/8"), "A")?;
    assert_eq!(
        rib.insert(pfx("11.0.0.0/8"), "B"),
        Err(EngineError::CapacityExceeded)
    );
    // Updates do not need room.
    assert_eq!(rib.insert(pfx("10.0.0.0/8"), "A2")?, 2);
    assert_eq!(
        rib.stats().errors.iter().map(|e| e.count).sum::<u64>(),
        1
    );

    Ok(())
}

#[derive(Debug)]
struct AlwaysDisk;

impl PlacementPolicy for AlwaysDisk {
    fn name(&self) -> &'static str {
        "always_disk"
    }

    fn place(&self, _meta: &EntryMeta, _tiers: &TierState) -> TierLocation {
        TierLocation::Disk
    }
}

#[test]
fn custom_policies() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let mut config = hybrid(&dir, 16, 0.5);
    config.placement_strategy = PlacementStrategy::Custom;

    assert!(matches!(
        TieredRib::new_with_config(StorageConfig::Hybrid(config.clone())),
        Err(EngineError::ConfigInvalid(_))
    ));
    assert!(matches!(
        TieredRib::new_with_policy(
            StorageConfig::default(),
            Box::new(AlwaysDisk)
        ),
        Err(EngineError::ConfigInvalid(_))
    ));

    let rib = TieredRib::new_with_policy(
        StorageConfig::Hybrid(config),
        Box::new(AlwaysDisk),
    )?;
    let prefix = pfx("10.0.0.0/24");
    rib.insert(prefix, "P1")?;
    assert_eq!(rib.location(&prefix), Some(TierLocation::Disk));
    assert_eq!(rib.run_migration().promoted, 0);

    Ok(())
}

#[test]
fn recovery_leaves_a_running_batch_alone() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let rib = TieredRib::new_with_config(StorageConfig::Hybrid(hybrid(
        &dir, 16, 0.5,
    )))?;
    let prefix = pfx("10.0.0.0/24");
    rib.insert(prefix, "P1")?;

    let state = rib.state();
    let disk = state.backend.disk().unwrap();
    let task = MigrationTask {
        prefix,
        from: TierLocation::Memory,
        to: TierLocation::Disk,
        version: 1,
        attempts: 0,
        state: MigrationState::InFlight,
    };

    // A run that copied the entry and did not commit yet.
    let running = state.migration.hold();
    disk.put(&RouteEntry::new(prefix, Payload::from("P1"), 1))?;
    state.migration.strand(task.clone());
    state.migration.recover(state, false);
    assert_eq!(state.migration.in_flight(), 1);
    assert_eq!(disk.versions(&prefix).len(), 1);
    assert!(state.migration.queued().is_empty());

    assert!(state.migration.try_commit(state, &task));
    drop(running);

    assert_eq!(rib.location(&prefix), Some(TierLocation::Disk));
    assert_eq!(state.backend.memory().unwrap().size(), 0);
    let entry = rib.get(&prefix)?.unwrap();
    assert_eq!((entry.payload, entry.version), (Payload::from("P1"), 1));

    Ok(())
}

#[test]
fn commits_need_the_target_copy() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let rib = TieredRib::new_with_config(StorageConfig::Hybrid(hybrid(
        &dir, 16, 0.5,
    )))?;
    let prefix = pfx("10.0.0.0/24");
    rib.insert(prefix, "P1")?;

    // The copy on disk is gone, for whatever reason.
    let state = rib.state();
    let task = MigrationTask {
        prefix,
        from: TierLocation::Memory,
        to: TierLocation::Disk,
        version: 1,
        attempts: 0,
        state: MigrationState::InFlight,
    };
    assert!(!state.migration.try_commit(state, &task));

    assert_eq!(rib.location(&prefix), Some(TierLocation::Memory));
    assert_eq!(rib.get(&prefix)?.unwrap().payload, Payload::from("P1"));

    Ok(())
}

// The background worker starts, and may run a threshold batch, while the
// explicit run is going on.
#[test]
fn demotions_never_lose_entries() -> Result<(), Box<dyn Error>> {
    init();
    let prefixes =
        ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.3.0/24"].map(pfx);
    for _ in 0..10 {
        let dir = tempfile::tempdir()?;
        let rib = TieredRib::new_with_config(StorageConfig::Hybrid(hybrid(
            &dir, 4, 0.5,
        )))?;
        for p in prefixes {
            rib.insert(p, "P1")?;
        }
        rib.run_migration();
        for p in prefixes {
            assert!(rib.contains(&p));
            assert_eq!(rib.get(&p)?.unwrap().version, 1);
        }
        assert_eq!(rib.prefixes_count(), 4);
    }

    Ok(())
}

#[test]
fn failed_demotions_keep_the_memory_copy() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let mut config = hybrid(&dir, 4, 0.5);
    // Room for one 100 byte version only.
    config.disk.compression = false;
    config.disk.max_size_bytes = Some(150);
    let rib = TieredRib::new_with_config(StorageConfig::Hybrid(config))?;
    let payload = "x".repeat(57);
    let prefixes =
        ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.3.0/24"].map(pfx);
    for p in prefixes {
        rib.insert(p, payload.as_str())?;
    }

    rib.run_migration();
    let state = rib.state();
    assert_eq!(state.backend.memory().unwrap().size(), 3);
    assert_eq!(state.backend.disk().unwrap().len(), 1);

    let mut in_memory = 0;
    for p in prefixes {
        let entry = rib.get(&p)?.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.payload, Payload::from(payload.as_str()));
        if rib.location(&p) == Some(TierLocation::Memory) {
            in_memory += 1;
        }
    }
    assert_eq!(in_memory, 3);

    let stats = rib.stats();
    assert_eq!(stats.migrations_committed, 1);
    assert!(stats.migrations_failed > 0);
    assert!(state
        .counters
        .error_count(Operation::Migration, ErrorKind::StorageExhausted)
        > 0);

    Ok(())
}

#[test]
fn lossy_shutdowns_are_reported() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let config = || {
        // No demotions, and room on disk for two 100 byte versions.
        let mut config = hybrid(&dir, 4, 1.0);
        config.disk.compression = false;
        config.disk.max_size_bytes = Some(250);
        StorageConfig::Hybrid(config)
    };
    let rib = TieredRib::new_with_config(config())?;
    let payload = "x".repeat(57);
    for p in ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"].map(pfx) {
        rib.insert(p, payload.as_str())?;
    }
    assert_eq!(rib.state().backend.memory().unwrap().size(), 3);

    let counters = rib.state().counters.clone();
    assert_eq!(rib.shutdown(), Err(EngineError::StorageExhausted));
    assert_eq!(
        counters.error_count(Operation::Shutdown, ErrorKind::StorageExhausted),
        1
    );

    // What could be written is there.
    let rib = TieredRib::new_with_config(config())?;
    assert_eq!(rib.prefixes_count(), 2);

    Ok(())
}
