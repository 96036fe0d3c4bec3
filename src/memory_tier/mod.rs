//! The memory tier: an ordered, concurrent map of prefix to the current
//! route entry, bounded by a maximum number of entries.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use crossbeam_utils::CachePadded;
use inetnum::addr::Prefix;
use log::trace;

use crate::errors::EngineError;
use crate::types::prefix_key::PrefixKey;
use crate::types::RouteEntry;

//------------ MemoryTier ----------------------------------------------------

/// The in-memory tier.
///
/// All operations are O(log n). The tier never evicts anything by itself:
/// when it holds `capacity` entries, a `put` of a new prefix fails with
/// [EngineError::CapacityExceeded], and it is up to the caller to make room
/// (by migration) or to put the entry somewhere else.
///
/// Writes for the same prefix must be serialized by the caller. Writes for
/// different prefixes, and all reads, can run concurrently.
#[derive(Debug)]
pub struct MemoryTier {
    entries: SkipMap<PrefixKey, RouteEntry>,
    // The number of entries, also used to reserve room for a new entry
    // before it is inserted, so that concurrent inserts can never overshoot
    // the capacity.
    len: CachePadded<AtomicUsize>,
    capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: SkipMap::new(),
            len: CachePadded::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Store `entry` as the current entry for its prefix, replacing any
    /// existing entry. Replacing does not count against the capacity.
    pub fn put(&self, entry: RouteEntry) -> Result<(), EngineError> {
        let key = PrefixKey::from(&entry.prefix);
        if !self.entries.contains_key(&key) {
            self.reserve()?;
        }
        trace!("memory tier put {}", entry);
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn get(&self, prefix: &Prefix) -> Option<RouteEntry> {
        self.entries
            .get(&PrefixKey::from(prefix))
            .map(|e| e.value().clone())
    }

    /// Remove the entry for `prefix`, returning it if it was present.
    pub fn delete(&self, prefix: &Prefix) -> Option<RouteEntry> {
        let removed = self
            .entries
            .remove(&PrefixKey::from(prefix))
            .map(|e| e.value().clone());
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// The number of entries in the tier.
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    /// All prefixes in the tier, in prefix order.
    pub fn prefixes(&self) -> Vec<Prefix> {
        self.entries.iter().map(|e| e.value().prefix).collect()
    }

    fn reserve(&self) -> Result<(), EngineError> {
        let mut cur = self.len.load(Ordering::Acquire);
        loop {
            if cur >= self.capacity {
                return Err(EngineError::CapacityExceeded);
            }
            match self.len.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use super::*;
    use crate::types::Payload;

    fn entry(p: &str, payload: &str, version: u64) -> RouteEntry {
        RouteEntry::new(
            Prefix::from_str(p).unwrap(),
            Payload::from(payload),
            version,
        )
    }

    #[test]
    fn put_get_delete() {
        let tier = MemoryTier::new(10);
        let e = entry("10.0.0.0/24", "P1", 1);
        tier.put(e.clone()).unwrap();

        assert_eq!(tier.get(&e.prefix), Some(e.clone()));
        assert_eq!(tier.size(), 1);

        let e2 = entry("10.0.0.0/24", "P2", 2);
        tier.put(e2.clone()).unwrap();
        assert_eq!(tier.get(&e.prefix), Some(e2.clone()));
        assert_eq!(tier.size(), 1);

        assert_eq!(tier.delete(&e.prefix), Some(e2));
        assert_eq!(tier.delete(&e.prefix), None);
        assert_eq!(tier.size(), 0);
        assert!(tier.get(&e.prefix).is_none());
    }

    #[test]
    fn capacity_exceeded_without_eviction() {
        let tier = MemoryTier::new(2);
        tier.put(entry("10.0.0.0/24", "a", 1)).unwrap();
        tier.put(entry("10.0.1.0/24", "b", 1)).unwrap();
        assert!(tier.is_full());

        assert_eq!(
            tier.put(entry("10.0.2.0/24", "c", 1)),
            Err(EngineError::CapacityExceeded)
        );
        // Existing data is untouched, and updating an existing prefix still
        // works at capacity.
        assert_eq!(tier.size(), 2);
        tier.put(entry("10.0.1.0/24", "b2", 2)).unwrap();
        assert_eq!(
            tier.get(&Prefix::from_str("10.0.1.0/24").unwrap())
                .map(|e| e.version),
            Some(2)
        );
    }

    #[test]
    fn prefixes_are_ordered() {
        let tier = MemoryTier::new(10);
        for p in ["10.1.0.0/16", "2001:db8::/32", "10.0.0.0/24", "10.0.0.0/8"]
        {
            tier.put(entry(p, "x", 1)).unwrap();
        }
        let pfxs = tier
            .prefixes()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            pfxs,
            vec!["10.0.0.0/8", "10.0.0.0/24", "10.1.0.0/16", "2001:db8::/32"]
        );
    }

    #[test]
    fn concurrent_puts_never_overshoot() {
        let tier = Arc::new(MemoryTier::new(100));
        let handles = (0..4_u8)
            .map(|t| {
                let tier = Arc::clone(&tier);
                std::thread::spawn(move || {
                    let mut ok = 0;
                    for i in 0..=255_u8 {
                        let p = format!("10.{}.{}.0/24", t, i);
                        if tier.put(entry(&p, "x", 1)).is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect::<Vec<_>>();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, 100);
        assert_eq!(tier.size(), 100);
        assert_eq!(tier.prefixes().len(), 100);
    }
}
