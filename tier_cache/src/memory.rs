use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, error, trace, warn};

use crate::config::{CacheSettings, ExpiryPolicy};
use crate::disk::DiskStore;
use crate::element::Element;
use crate::error::Result;

/// The in-memory tier: a capacity-bounded map ordered by access recency.
///
/// A lookup that hits moves the entry to the freshest end, so the entry
/// popped on overflow is always the least recently accessed one. Evicted
/// entries that are still live are spooled to the disk store when overflow
/// is enabled, otherwise dropped.
pub struct MemoryStore {
    name: String,
    capacity: usize,
    policy: ExpiryPolicy,
    persistent: bool,
    disk_store: Option<Arc<DiskStore>>,
    /// Kept unbounded; the capacity bound is enforced by hand so that a
    /// configured capacity of zero works (every put evicts immediately).
    map: Mutex<LruCache<String, Element>>,
}

impl MemoryStore {
    pub fn new(settings: &CacheSettings, disk_store: Option<Arc<DiskStore>>) -> Self {
        if settings.max_elements_in_memory == 0 {
            warn!(
                "Cache {} has a max_elements_in_memory of 0; every put spills straight through the memory store",
                settings.name
            );
        }
        Self {
            name: settings.name.clone(),
            capacity: settings.max_elements_in_memory,
            policy: settings.expiry_policy(),
            persistent: settings.disk_persistent,
            disk_store,
            map: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Inserts an element as the most recently used entry, evicting from the
    /// stale end until the store is back within capacity.
    pub fn put(&self, element: Element) -> Result<()> {
        let mut map = self.map.lock()?;
        map.put(element.key().to_string(), element);
        while map.len() > self.capacity {
            if let Some((_, evicted)) = map.pop_lru() {
                self.evict(evicted);
            }
        }
        Ok(())
    }

    /// Gets an element, promoting it to most recently used and updating its
    /// access statistics.
    pub fn get(&self, key: &str) -> Result<Option<Element>> {
        let mut map = self.map.lock()?;
        let Some(element) = map.get_mut(key) else {
            trace!("{}Cache: MemoryStore miss for {key}", self.name);
            return Ok(None);
        };
        trace!("{}Cache: MemoryStore hit for {key}", self.name);
        element.update_access_statistics();
        Ok(Some(element.clone()))
    }

    /// Gets an element without promotion or statistics updates. Used by
    /// expiry probes.
    pub fn get_quiet(&self, key: &str) -> Result<Option<Element>> {
        let map = self.map.lock()?;
        Ok(map.peek(key).cloned())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut map = self.map.lock()?;
        let removed = map.pop(key).is_some();
        if !removed {
            debug!("{}Cache: cannot remove entry as key {key} was not found", self.name);
        }
        Ok(removed)
    }

    pub fn remove_all(&self) -> Result<()> {
        Ok(self.map.lock()?.clear())
    }

    /// Keys in recency order, most recently used first.
    pub fn keys(&self) -> Result<Vec<String>> {
        let map = self.map.lock()?;
        Ok(map.iter().map(|(key, _)| key.clone()).collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.map.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.map.lock()?.is_empty())
    }

    /// Summed serialized size of the resident elements. Walks every entry,
    /// so this is expensive on large stores.
    pub fn size_in_bytes(&self) -> Result<u64> {
        let map = self.map.lock()?;
        Ok(map.iter().map(|(_, e)| e.serialized_size() as u64).sum())
    }

    /// For a persistent cache, pushes every resident element to the disk
    /// store spool, then releases the backing map.
    pub fn dispose(&self) -> Result<()> {
        let mut map = self.map.lock()?;
        if self.persistent {
            if let Some(disk_store) = &self.disk_store {
                debug!(
                    "{}Cache is persistent; spooling {} elements to the disk store",
                    self.name,
                    map.len()
                );
                for (_, element) in map.iter() {
                    if let Err(e) = disk_store.put(element.clone()) {
                        error!("{}Cache: could not spool element to disk on dispose: {e}", self.name);
                    }
                }
            }
        }
        map.clear();
        Ok(())
    }

    /// Eviction hook for the least recently used entry: expired entries are
    /// dropped outright, live ones overflow to the disk store when one is
    /// attached.
    fn evict(&self, element: Element) {
        if self.policy.is_expired(&element) {
            return;
        }
        if let Some(disk_store) = &self.disk_store {
            debug!(
                "{}Cache: memory store over capacity of {}; spooling element with key {:?} to disk",
                self.name,
                self.capacity,
                element.key()
            );
            if let Err(e) = disk_store.put(element) {
                error!("{}Cache: could not spool evicted element to disk: {e}", self.name);
            }
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("overflow", &self.disk_store.is_some())
            .finish()
    }
}
