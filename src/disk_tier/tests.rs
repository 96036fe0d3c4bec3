use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;

use inetnum::addr::Prefix;
use lsm_tree::AbstractTree;
use zerocopy::IntoBytes;

use super::DiskTier;
use crate::errors::EngineError;
use crate::rib::config::{DiskStorageConfig, SyncMode};
use crate::stats::Counters;
use crate::types::prefix_key::VersionedKey;
use crate::types::{range_id, Payload, RouteEntry};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &tempfile::TempDir) -> DiskStorageConfig {
    let mut config = DiskStorageConfig::new(dir.path());
    config.sync_mode = SyncMode::Strict;
    config
}

fn entry(prefix: &str, payload: &str, version: u64) -> RouteEntry {
    RouteEntry::new(
        Prefix::from_str(prefix).unwrap(),
        Payload::from(payload),
        version,
    )
}

#[test]
fn newest_version_wins() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let tier = DiskTier::open(&config(&dir), Arc::default())?;
    let prefix = Prefix::from_str("10.0.0.0/24")?;

    tier.put(&entry("10.0.0.0/24", "P1", 1))?;
    tier.put(&entry("10.0.0.0/24", "P2", 2))?;

    let e = tier.get(&prefix)?.unwrap();
    assert_eq!(e.payload, Payload::from("P2"));
    assert_eq!(e.version, 2);
    assert_eq!(tier.versions(&prefix).len(), 2);
    assert_eq!(tier.len(), 1);
    assert!(tier.dirty_ranges().contains(range_id(&prefix)));

    tier.delete(&prefix, 3)?;
    assert_eq!(tier.get(&prefix)?, None);
    assert!(!tier.contains(&prefix));
    assert_eq!(tier.newest_version(&prefix), Some((3, true)));
    assert!(tier.latest(&prefix)?.unwrap().tombstone);

    Ok(())
}

#[test]
fn size_accounting() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let tier = DiskTier::open(&config(&dir), Arc::default())?;
    let prefix = Prefix::from_str("2001:db8::/32")?;

    assert_eq!(tier.size_bytes(), 0);
    tier.put(&entry("2001:db8::/32", "a payload", 1))?;
    let one = tier.size_bytes();
    assert!(one > 0);

    tier.put(&entry("2001:db8::/32", "a payload", 2))?;
    assert_eq!(tier.size_bytes(), 2 * one);

    // Writing the same version again replaces it.
    tier.put(&entry("2001:db8::/32", "a payload", 2))?;
    assert_eq!(tier.size_bytes(), 2 * one);

    assert!(tier.remove_version(&prefix, 1)?);
    assert!(!tier.remove_version(&prefix, 1)?);
    assert_eq!(tier.size_bytes(), one);

    assert_eq!(tier.evict(&prefix)?, one);
    assert_eq!(tier.size_bytes(), 0);
    assert!(tier.is_empty());

    Ok(())
}

#[test]
fn storage_exhausted() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let mut config = config(&dir);
    config.compression = false;
    config.max_size_bytes = Some(200);
    let tier = DiskTier::open(&config, Arc::default())?;

    // 26 bytes of key, 17 of header, 57 of payload: 100 bytes per version.
    let payload = "x".repeat(57);
    tier.put(&entry("192.0.2.0/24", &payload, 1))?;
    tier.put(&entry("198.51.100.0/24", &payload, 1))?;
    assert_eq!(tier.size_bytes(), 200);

    assert_eq!(
        tier.put(&entry("203.0.113.0/24", &payload, 1)),
        Err(EngineError::StorageExhausted)
    );
    assert_eq!(tier.size_bytes(), 200);
    assert_eq!(tier.get(&Prefix::from_str("203.0.113.0/24")?)?, None);

    // Replacing a version with one of the same size still fits, and
    // tombstones are always accepted.
    tier.put(&entry("192.0.2.0/24", &payload, 1))?;
    tier.delete(&Prefix::from_str("198.51.100.0/24")?, 2)?;
    assert!(tier.size_bytes() > 200);

    Ok(())
}

#[test]
fn reopen_rebuilds_index() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let mut config = config(&dir);
    config.sync_mode = SyncMode::None;

    let size = {
        let tier = DiskTier::open(&config, Arc::default())?;
        tier.put(&entry("10.0.0.0/8", "one", 1))?;
        tier.put(&entry("10.0.0.0/8", "two", 2))?;
        tier.put(&entry("2001:db8::/48", "three", 1))?;
        tier.delete(&Prefix::from_str("2001:db8::/48")?, 2)?;
        tier.close()?;
        tier.size_bytes()
    };

    let tier = DiskTier::open(&config, Arc::default())?;
    assert_eq!(tier.size_bytes(), size);
    assert_eq!(tier.len(), 2);
    assert_eq!(
        tier.get(&Prefix::from_str("10.0.0.0/8")?)?.unwrap().payload,
        Payload::from("two")
    );
    assert_eq!(
        tier.newest_version(&Prefix::from_str("2001:db8::/48")?),
        Some((2, true))
    );
    // Writes after the reopen sort after the ones before it.
    tier.put(&entry("10.0.0.0/8", "three", 3))?;
    assert_eq!(
        tier.get(&Prefix::from_str("10.0.0.0/8")?)?.unwrap().version,
        3
    );
    assert_eq!(
        tier.prefixes(),
        vec![
            Prefix::from_str("10.0.0.0/8")?,
            Prefix::from_str("2001:db8::/48")?
        ]
    );

    Ok(())
}

#[test]
fn corrupt_values_are_quarantined() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let counters = Arc::new(Counters::default());
    let tier = DiskTier::open(&config(&dir), counters.clone())?;
    let prefix = Prefix::from_str("192.0.2.0/24")?;

    tier.put(&entry("192.0.2.0/24", "attributes", 1))?;
    // Overwrite the stored value behind the tier's back.
    let key = VersionedKey::new(&prefix, 1);
    tier.tree.insert(key.as_bytes(), vec![0_u8; 30], tier.next_seqno());

    assert_eq!(tier.get(&prefix)?, None);
    assert_eq!(counters.quarantined(), 1);
    assert!(tier.versions(&prefix)[0].quarantined);

    // Compaction removes the quarantined version and the prefix with it.
    tier.take_dirty_ranges();
    let res = tier.compact_prefix(&prefix, crate::types::now_ms(), 0);
    assert_eq!(res.removed_versions, 1);
    assert_eq!(res.gone, Some(1));
    assert!(tier.is_empty());
    assert_eq!(tier.size_bytes(), 0);

    Ok(())
}

#[test]
fn compact_prefix_is_idempotent() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let tier = DiskTier::open(&config(&dir), Arc::default())?;
    let live = Prefix::from_str("10.0.0.0/24")?;
    let withdrawn = Prefix::from_str("10.1.0.0/24")?;

    for v in 1..=3 {
        tier.put(&entry("10.0.0.0/24", &format!("P{}", v), v))?;
    }
    tier.put(&entry("10.1.0.0/24", "P1", 1))?;
    tier.delete(&withdrawn, 2)?;

    let now = crate::types::now_ms();
    let ranges = tier.take_dirty_ranges();
    assert_eq!(ranges.len(), 1);
    let prefixes = tier.prefixes_by_range(&ranges);
    assert_eq!(prefixes.get(&range_id(&live)).map(|p| p.len()), Some(2));

    // The tombstone is still inside its retention window.
    let res = tier.compact_prefix(&live, now, 60_000);
    assert_eq!(res.removed_versions, 2);
    let res = tier.compact_prefix(&withdrawn, now, 60_000);
    assert_eq!(res.removed_versions, 1);
    assert!(res.pending);
    assert_eq!(res.gone, None);
    tier.reclaim()?;

    let size = tier.size_bytes();
    assert_eq!(tier.compact_prefix(&live, now, 60_000).removed_versions, 0);
    assert_eq!(tier.size_bytes(), size);
    assert_eq!(tier.get(&live)?.unwrap().payload, Payload::from("P3"));

    // Once the window has passed the prefix goes altogether.
    let res = tier.compact_prefix(&withdrawn, now + 60_000, 60_000);
    assert_eq!(res.gone, Some(2));
    assert_eq!(tier.newest_version(&withdrawn), None);
    let res = tier.compact_prefix(&withdrawn, now + 60_000, 60_000);
    assert_eq!(res, Default::default());
    tier.reclaim()?;

    assert_eq!(tier.len(), 1);
    Ok(())
}

#[test]
fn io_failures_are_retried_then_degrade() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let mut config = config(&dir);
    config.io_retry.max_retries = 2;
    config.io_retry.initial_delay_ms = 1;
    config.io_retry.max_delay_ms = 4;
    let tier = DiskTier::open(&config, Arc::default())?;

    // Fails once, then works.
    let mut attempts = 0;
    let res = tier.with_retry("write", || {
        attempts += 1;
        if attempts == 1 {
            Err(EngineError::IoFailure("no space left".into()))
        } else {
            Ok(attempts)
        }
    });
    assert_eq!(res, Ok(2));
    assert!(!tier.is_degraded());

    // Only I/O failures are retried.
    let mut attempts = 0;
    let res: Result<(), _> = tier.with_retry("read", || {
        attempts += 1;
        Err(EngineError::CorruptEntry)
    });
    assert_eq!(res, Err(EngineError::CorruptEntry));
    assert_eq!(attempts, 1);
    assert!(!tier.is_degraded());

    let mut attempts = 0;
    let res: Result<(), _> = tier.with_retry("write", || {
        attempts += 1;
        Err(EngineError::IoFailure("device gone".into()))
    });
    assert!(matches!(res, Err(EngineError::IoFailure(_))));
    assert_eq!(attempts, 3);
    assert!(tier.is_degraded());

    // The next sync that works clears it.
    tier.put(&entry("10.0.0.0/24", "P1", 1))?;
    assert!(!tier.is_degraded());
    let prefix = Prefix::from_str("10.0.0.0/24")?;
    assert_eq!(tier.get(&prefix)?.unwrap().version, 1);

    Ok(())
}

#[test]
fn segments_are_merged_on_sync() -> Result<(), Box<dyn Error>> {
    init();
    let dir = tempfile::tempdir()?;
    let tier = DiskTier::open(&config(&dir), Arc::default())?;

    // Every strict put syncs, which flushes a segment.
    let prefixes = (0..300u32)
        .filter_map(|i| {
            let addr = std::net::Ipv4Addr::from(0x0a00_0000 | i << 8);
            Prefix::new(addr.into(), 24).ok()
        })
        .collect::<Vec<_>>();
    for prefix in &prefixes {
        tier.put(&RouteEntry::new(*prefix, Payload::from("P1"), 1))?;
        assert!(tier.segment_count() <= 2 * super::MAX_SEGMENTS);
    }
    assert!(!tier.needs_merge());

    for prefix in &prefixes {
        assert_eq!(tier.get(prefix)?.unwrap().payload, Payload::from("P1"));
    }
    assert_eq!(tier.len(), 300);

    Ok(())
}
