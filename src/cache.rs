use std::cmp::min;
use std::collections::{HashMap, LinkedList, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Slot<K> {
    key: K,
    freq: u8,
}

/// Bounded key-value cache with small/main/ghost queues.
///
/// New entries enter the small queue; entries accessed at least twice before
/// eviction are promoted to the main queue; keys evicted from small without
/// reuse are remembered in a ghost list so a quick re-insert lands directly
/// in main. Used by the B-tree as a bounded offset-to-node map.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    max_cache_size: usize,
    max_main_size: usize,
    small: VecDeque<Slot<K>>,
    main: VecDeque<Slot<K>>,
    ghost: LinkedList<K>,
    ghost_index: HashMap<K, ()>,
    index: HashMap<K, V>,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(max_cache_size: usize) -> Self {
        let max_small_size = (max_cache_size / 10).max(1);
        let max_main_size = max_cache_size.saturating_sub(max_small_size).max(1);

        Cache {
            max_cache_size,
            max_main_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: LinkedList::new(),
            ghost_index: HashMap::new(),
            index: HashMap::new(),
        }
    }

    /// Returns a clone of the cached value for the given key, if present.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.index.get(key).cloned()?;
        for slot in self.small.iter_mut().chain(self.main.iter_mut()) {
            if slot.key == *key {
                slot.freq = min(slot.freq + 1, MAX_FREQUENCY_LIMIT);
                break;
            }
        }
        Some(value)
    }

    /// Inserts a new entry, evicting as needed to stay within capacity.
    pub fn insert(&mut self, key: K, value: V) {
        if self.max_cache_size == 0 || self.index.contains_key(&key) {
            return;
        }
        self.evict();

        self.index.insert(key.clone(), value);
        let slot = Slot { key: key.clone(), freq: 0 };
        if self.ghost_index.remove(&key).is_some() {
            self.main.push_back(slot);
        } else {
            self.small.push_back(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn evict(&mut self) {
        while self.small.len() + self.main.len() >= self.max_cache_size {
            if self.main.len() >= self.max_main_size || self.small.is_empty() {
                self.evict_main();
            } else {
                self.evict_small();
            }
        }
    }

    fn evict_main(&mut self) {
        while let Some(mut slot) = self.main.pop_front() {
            if slot.freq > 0 {
                slot.freq -= 1;
                self.main.push_back(slot);
            } else {
                self.index.remove(&slot.key);
                break;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(slot) = self.small.pop_front() {
            if slot.freq > 1 {
                self.main.push_back(slot);
            } else {
                self.index.remove(&slot.key);
                self.remember_ghost(slot.key);
                break;
            }
        }
    }

    fn remember_ghost(&mut self, key: K) {
        if self.ghost.len() >= self.max_cache_size {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_index.remove(&old);
            }
        }
        self.ghost_index.insert(key.clone(), ());
        self.ghost.push_back(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read() {
        let mut cache = Cache::new(4);
        cache.insert(1u64, "a");
        cache.insert(2u64, "b");

        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&2), Some("b"));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn stays_within_capacity() {
        let capacity = 8;
        let mut cache = Cache::new(capacity);
        for i in 0..100u64 {
            cache.insert(i, i);
        }
        assert!(cache.len() <= capacity);
    }

    #[test]
    fn hot_entries_survive_eviction() {
        let mut cache = Cache::new(8);
        cache.insert(0u64, 0);
        for _ in 0..3 {
            cache.get(&0);
        }
        for i in 1..100u64 {
            cache.insert(i, i);
        }
        assert_eq!(cache.get(&0), Some(0));
    }

    #[test]
    fn ghost_keys_reenter_main() {
        let mut cache = Cache::new(8);
        for i in 0..20u64 {
            cache.insert(i, i);
        }
        // Key 0 was evicted from small without reuse; re-inserting it should
        // still be a miss first, then a hit after the insert.
        assert_eq!(cache.get(&0), None);
        cache.insert(0, 0);
        assert_eq!(cache.get(&0), Some(0));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let mut cache = Cache::new(0);
        cache.insert(1u64, 1);
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }
}
