//! Per-shard durable key-value store plus two append-only log tables
//! (`spec.md` §4.2). Backed by `sled`, mirroring the cache-then-sled
//! layering in the teacher's workflow-engine state store, specialized so
//! the append-only tables use big-endian id keys and get id-ordered
//! iteration from sled's native key ordering.

use crate::domain::{UsageRecord, VerificationRecord};
use crate::error::{LimiterError, LimiterResult};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ShardStore {
    db: sled::Db,
    usage_tree: sled::Tree,
    verification_tree: sled::Tree,
    next_usage_id: AtomicU64,
    next_verification_id: AtomicU64,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn last_id(tree: &sled::Tree) -> LimiterResult<u64> {
    match tree.last().map_err(|e| LimiterError::Durable(e.to_string()))? {
        Some((key, _)) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key);
            Ok(u64::from_be_bytes(buf))
        }
        None => Ok(0),
    }
}

impl ShardStore {
    pub fn open<P: AsRef<Path>>(path: P) -> LimiterResult<Self> {
        let db = sled::open(path).map_err(|e| LimiterError::Durable(format!("failed to open shard store: {e}")))?;
        let usage_tree = db
            .open_tree("usage_records")
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        let verification_tree = db
            .open_tree("verifications")
            .map_err(|e| LimiterError::Durable(e.to_string()))?;

        let next_usage_id = last_id(&usage_tree)? + 1;
        let next_verification_id = last_id(&verification_tree)? + 1;

        Ok(Self {
            db,
            usage_tree,
            verification_tree,
            next_usage_id: AtomicU64::new(next_usage_id),
            next_verification_id: AtomicU64::new(next_verification_id),
        })
    }

    // --- KV namespace ---

    pub fn get(&self, key: &str) -> LimiterResult<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(key.as_bytes())
            .map_err(|e| LimiterError::Durable(e.to_string()))?
            .map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> LimiterResult<()> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.db.flush().map_err(|e| LimiterError::Durable(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> LimiterResult<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        Ok(())
    }

    pub fn list_prefix(&self, prefix: &str) -> LimiterResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item.map_err(|e| LimiterError::Durable(e.to_string()))?;
            let key = String::from_utf8_lossy(&key).to_string();
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    pub fn delete_all_kv(&self) -> LimiterResult<()> {
        self.db.clear().map_err(|e| LimiterError::Durable(e.to_string()))
    }

    // --- usage_records ---

    pub fn insert_usage(&self, record: &UsageRecord) -> LimiterResult<u64> {
        let id = self.next_usage_id.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(record).map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.usage_tree
            .insert(id_key(id), value)
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.usage_tree.flush().map_err(|e| LimiterError::Durable(e.to_string()))?;
        Ok(id)
    }

    pub fn select_usage_batch(&self, from_id: u64, limit: usize) -> LimiterResult<Vec<(u64, UsageRecord)>> {
        select_batch(&self.usage_tree, from_id, limit)
    }

    pub fn delete_usage_range(&self, first_id: u64, last_id: u64) -> LimiterResult<()> {
        delete_range(&self.usage_tree, first_id, last_id)
    }

    pub fn count_usage(&self) -> usize {
        self.usage_tree.len()
    }

    // --- verifications ---

    pub fn insert_verification(&self, record: &VerificationRecord) -> LimiterResult<u64> {
        let id = self.next_verification_id.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(record).map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.verification_tree
            .insert(id_key(id), value)
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.verification_tree
            .flush()
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        Ok(id)
    }

    pub fn select_verification_batch(&self, from_id: u64, limit: usize) -> LimiterResult<Vec<(u64, VerificationRecord)>> {
        select_batch(&self.verification_tree, from_id, limit)
    }

    pub fn delete_verification_range(&self, first_id: u64, last_id: u64) -> LimiterResult<()> {
        delete_range(&self.verification_tree, first_id, last_id)
    }

    pub fn count_verifications(&self) -> usize {
        self.verification_tree.len()
    }

    pub fn count_all(&self) -> usize {
        self.count_usage() + self.count_verifications()
    }

    pub fn delete_all(&self) -> LimiterResult<()> {
        self.usage_tree.clear().map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.verification_tree
            .clear()
            .map_err(|e| LimiterError::Durable(e.to_string()))?;
        self.delete_all_kv()
    }
}

fn select_batch<T: serde::de::DeserializeOwned>(
    tree: &sled::Tree,
    from_id: u64,
    limit: usize,
) -> LimiterResult<Vec<(u64, T)>> {
    let mut out = Vec::with_capacity(limit.min(64));
    for item in tree.range(id_key(from_id)..) {
        if out.len() >= limit {
            break;
        }
        let (key, value) = item.map_err(|e| LimiterError::Durable(e.to_string()))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key);
        let id = u64::from_be_bytes(buf);
        let record: T = serde_json::from_slice(&value).map_err(|e| LimiterError::Durable(e.to_string()))?;
        out.push((id, record));
    }
    Ok(out)
}

fn delete_range(tree: &sled::Tree, first_id: u64, last_id: u64) -> LimiterResult<()> {
    for id in first_id..=last_id {
        tree.remove(id_key(id)).map_err(|e| LimiterError::Durable(e.to_string()))?;
    }
    tree.flush().map_err(|e| LimiterError::Durable(e.to_string()))?;
    Ok(())
}
