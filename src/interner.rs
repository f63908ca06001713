//! Process-wide concurrent intern maps
//!
//! One generic map serves both global symbols (keyed by name) and section
//! fragments (keyed by content bytes). The contract both callers rely on:
//! `insert_with` is idempotent and address-stable, so every caller that
//! interns an equal key observes the same `Arc` for the life of the map,
//! and nothing is ever removed.
//!
//! The table is sharded so concurrent inserts only contend when their
//! keys hash to the same shard; lookups of already-interned keys take a
//! shared lock.

use std::hash::Hasher;
use std::sync::{Arc, RwLock};

use rustc_hash::{FxHashMap, FxHasher};

/// Number of independently locked shards. Power of two.
const NUM_SHARDS: usize = 64;

/// Initial capacity spread across the shards, sized so a typical link
/// does not rehash while the input files are being parsed.
const MIN_CAPACITY: usize = 2048;

#[derive(Debug)]
struct Shard<V> {
    map: RwLock<FxHashMap<Box<[u8]>, Arc<V>>>,
}

#[derive(Debug)]
/// A sharded concurrent map from byte strings to interned values
pub struct ConcurrentMap<V> {
    shards: Box<[Shard<V>]>,
}

impl<V> Default for ConcurrentMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ConcurrentMap<V> {
    /// Create an empty map with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Create an empty map sized for roughly `capacity` keys
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = crate::next_power_of_two(capacity.max(MIN_CAPACITY) as u64) as usize;
        let per_shard = capacity / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| Shard {
                map: RwLock::new(FxHashMap::with_capacity_and_hasher(
                    per_shard,
                    Default::default(),
                )),
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &[u8]) -> &Shard<V> {
        let mut hasher = FxHasher::default();
        hasher.write(key);
        let hash = hasher.finish() as usize;
        &self.shards[hash & (NUM_SHARDS - 1)]
    }

    /// Look up an interned value without inserting
    pub fn get(&self, key: &[u8]) -> Option<Arc<V>> {
        crate::read_lock(&self.shard(key).map).get(key).cloned()
    }

    /// Intern `key`, constructing the value on first insertion.
    ///
    /// Returns the canonical value and whether this call created it.
    /// Losers of an insert race observe the winner's value; the
    /// constructor runs at most once per key.
    pub fn insert_with(&self, key: &[u8], ctor: impl FnOnce() -> V) -> (Arc<V>, bool) {
        let shard = self.shard(key);

        if let Some(existing) = crate::read_lock(&shard.map).get(key) {
            return (Arc::clone(existing), false);
        }

        let mut map = crate::write_lock(&shard.map);
        if let Some(existing) = map.get(key) {
            return (Arc::clone(existing), false);
        }
        let value = Arc::new(ctor());
        map.insert(key.into(), Arc::clone(&value));
        (value, true)
    }

    /// Visit every interned entry. Callers run this between phases, when
    /// no inserter is active.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &Arc<V>)) {
        for shard in self.shards.iter() {
            for (key, value) in crate::read_lock(&shard.map).iter() {
                f(key, value);
            }
        }
    }

    /// Number of interned entries
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| crate::read_lock(&s.map).len())
            .sum()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let map: ConcurrentMap<u32> = ConcurrentMap::new();
        let (a, created_a) = map.insert_with(b"foo", || 1);
        let (b, created_b) = map.insert_with(b"foo", || 2);
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 1);
    }

    #[test]
    fn test_distinct_keys_get_distinct_slots() {
        let map: ConcurrentMap<u32> = ConcurrentMap::new();
        let (a, _) = map.insert_with(b"foo", || 1);
        let (b, _) = map.insert_with(b"bar", || 2);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_get_without_insert() {
        let map: ConcurrentMap<u32> = ConcurrentMap::new();
        assert!(map.get(b"missing").is_none());
        map.insert_with(b"present", || 7);
        assert_eq!(map.get(b"present").map(|v| *v), Some(7));
    }

    #[test]
    fn test_concurrent_inserters_observe_one_slot() {
        let map: Arc<ConcurrentMap<usize>> = Arc::new(ConcurrentMap::new());
        let mut handles = Vec::new();

        for tid in 0..8 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let mut ptrs = Vec::new();
                for i in 0..256usize {
                    let key = format!("key{}", i);
                    let (v, _) = map.insert_with(key.as_bytes(), || i + tid * 1000);
                    ptrs.push((i, Arc::as_ptr(&v) as usize, *v % 1000));
                }
                ptrs
            }));
        }

        let mut seen: FxHashMap<usize, (usize, usize)> = FxHashMap::default();
        for handle in handles {
            for (key, ptr, val) in handle.join().unwrap_or_default() {
                let entry = seen.entry(key).or_insert((ptr, val));
                // Every thread resolved the key to the same slot and the
                // same winning value.
                assert_eq!(entry.0, ptr);
                assert_eq!(entry.1, val);
            }
        }
        assert_eq!(map.len(), 256);
    }
}
