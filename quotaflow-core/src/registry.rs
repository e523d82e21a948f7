//! Sharded customer→actor registry (C5), adapted from the teacher's
//! consistent-hashing `ShardedMap<K,V>` and generalized to hold shard
//! handles keyed by customer id instead of arbitrary values.

use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const NUM_SHARDS: usize = 64;

pub struct ShardedRegistry<K, V> {
    shards: Vec<Arc<DashMap<K, V>>>,
    shard_mask: usize,
}

impl<K, V> ShardedRegistry<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        for _ in 0..NUM_SHARDS {
            shards.push(Arc::new(DashMap::new()));
        }
        Self {
            shards,
            shard_mask: NUM_SHARDS - 1,
        }
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.shard_mask
    }

    fn shard(&self, key: &K) -> &Arc<DashMap<K, V>> {
        &self.shards[self.shard_index(key)]
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.shard(&key).insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        self.shard(key).remove(key);
    }

    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        let shard = self.shard(&key);
        if let Some(existing) = shard.get(&key) {
            return existing.value().clone();
        }
        shard.entry(key).or_insert_with(make).value().clone()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for ShardedRegistry<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_by_key() {
        let registry: ShardedRegistry<String, i32> = ShardedRegistry::new();
        registry.insert("c1".to_string(), 1);
        assert_eq!(registry.get(&"c1".to_string()), Some(1));
        assert_eq!(registry.get(&"missing".to_string()), None);
    }

    #[test]
    fn get_or_insert_with_only_calls_factory_once() {
        let registry: ShardedRegistry<String, i32> = ShardedRegistry::new();
        let mut calls = 0;
        for _ in 0..5 {
            registry.get_or_insert_with("c1".to_string(), || {
                calls += 1;
                42
            });
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn len_reflects_inserts_across_shards() {
        let registry: ShardedRegistry<String, i32> = ShardedRegistry::new();
        for i in 0..100 {
            registry.insert(format!("cust-{i}"), i);
        }
        assert_eq!(registry.len(), 100);
    }
}
