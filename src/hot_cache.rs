//------------ HotCache ------------------------------------------------------

// A bounded LRU map of recently read disk entries. The cache never blocks a
// writer for long: population is skipped when the lock is contended, and
// invalidation only holds the lock for a single removal.
//
// Entries carry their version. A lookup returns an entry only if its version
// is the one the caller expects, so that a stale copy is never served, even
// if an invalidation raced with a population.

use std::num::NonZeroUsize;

use inetnum::addr::Prefix;
use log::trace;
use lru::LruCache;
use parking_lot::Mutex;

use crate::types::prefix_key::PrefixKey;
use crate::types::RouteEntry;

#[derive(Debug)]
pub(crate) struct HotCache {
    // None if the cache is disabled.
    entries: Option<Mutex<LruCache<PrefixKey, RouteEntry>>>,
}

impl HotCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity)
                .map(|c| Mutex::new(LruCache::new(c))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Returns the cached entry for `prefix` if it has `version`. A cached
    /// entry with any other version is dropped.
    pub fn get(&self, prefix: &Prefix, version: u64) -> Option<RouteEntry> {
        let entries = self.entries.as_ref()?;
        let key = PrefixKey::from(prefix);
        let mut entries = entries.lock();
        match entries.get(&key) {
            Some(e) if e.version == version => Some(e.clone()),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn populate(&self, entry: &RouteEntry) {
        let Some(entries) = &self.entries else {
            return;
        };
        if let Some(mut entries) = entries.try_lock() {
            entries.put(PrefixKey::from(&entry.prefix), entry.clone());
        } else {
            trace!("skipped cache population for {}", entry.prefix);
        }
    }

    pub fn invalidate(&self, prefix: &Prefix) {
        if let Some(entries) = &self.entries {
            entries.lock().pop(&PrefixKey::from(prefix));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.as_ref().map(|e| e.lock().len()).unwrap_or(0)
    }
}
