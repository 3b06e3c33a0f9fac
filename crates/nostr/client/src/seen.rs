//! Bounded recency set of processed event ids.
//!
//! Eviction drops the least recently marked id. A miss only means an event
//! gets processed twice; a hit is only ever returned for an id that was
//! marked and is still resident.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

struct SeenInner {
    capacity: usize,
    /// id -> recency stamp
    entries: HashMap<String, u64>,
    /// recency stamp -> id, oldest first
    order: BTreeMap<u64, String>,
    next_stamp: u64,
}

impl SeenInner {
    fn touch(&mut self, id: &str) -> bool {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        if let Some(old) = self.entries.get_mut(id) {
            self.order.remove(&*old);
            *old = stamp;
            self.order.insert(stamp, id.to_string());
            return true;
        }

        self.entries.insert(id.to_string(), stamp);
        self.order.insert(stamp, id.to_string());
        while self.entries.len() > self.capacity {
            match self.order.pop_first() {
                Some((_, evicted)) => {
                    self.entries.remove(&evicted);
                }
                None => break,
            }
        }
        false
    }
}

/// LRU set of event ids shared by every subscription.
pub struct SeenCache {
    inner: Mutex<SeenInner>,
}

impl SeenCache {
    /// Create a cache holding at most `capacity` ids (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_stamp: 0,
            }),
        }
    }

    /// Record `id` as seen, refreshing its recency.
    pub fn mark(&self, id: &str) {
        self.inner.lock().touch(id);
    }

    /// Whether `id` is resident. Does not refresh recency.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Mark `id` and report whether it had already been seen.
    pub fn check_and_mark(&self, id: &str) -> bool {
        self.inner.lock().touch(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}
