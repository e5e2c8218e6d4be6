//! In-memory LRU cache store.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{CacheError, CachePolicy, CacheStore, StoredEntry};

struct Slot {
    entry: StoredEntry,
    tick: u64,
}

#[derive(Default)]
struct Lru {
    slots: HashMap<String, Slot>,
    /// Access tick -> key, oldest first.
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Lru {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.to_string());
            self.next_tick += 1;
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.slots.remove(&key);
        }
    }
}

/// Bounded in-memory store.
///
/// Evicts the least recently used entry once `max_entries` is reached and
/// expires entries older than the policy's TTL on read.
pub struct MemoryCacheStore {
    policy: CachePolicy,
    inner: Mutex<Lru>,
}

impl MemoryCacheStore {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy: CachePolicy {
                max_entries: policy.max_entries.max(1),
                ..policy
            },
            inner: Mutex::new(Lru::default()),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let mut lru = self.inner.lock();
        let expired = match lru.slots.get(key) {
            Some(slot) => self.policy.is_expired(slot.entry.created_at, Utc::now()),
            None => return Ok(None),
        };
        if expired {
            lru.remove(key);
            return Ok(None);
        }
        lru.touch(key);
        Ok(lru.slots.get(key).map(|slot| slot.entry.clone()))
    }

    fn put(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let mut lru = self.inner.lock();
        lru.remove(key);
        while lru.slots.len() >= self.policy.max_entries {
            lru.evict_oldest();
        }
        let tick = lru.next_tick;
        lru.next_tick += 1;
        lru.order.insert(tick, key.to_string());
        lru.slots.insert(key.to_string(), Slot { entry, tick });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.inner.lock().remove(key))
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut lru = self.inner.lock();
        lru.slots.clear();
        lru.order.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.inner.lock().slots.len())
    }
}
