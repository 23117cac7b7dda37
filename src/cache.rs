//! Metadata-invalidated LRU document cache keyed by normalized path.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

/// A file's mtime/size at the moment a cache entry was populated. `None`
/// in either field stands in for "not finite" in the spec's original
/// floating-point stat model: a cache entry can never be considered valid
/// against a stat that didn't resolve to a real number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: Option<i64>,
    pub size: Option<u64>,
}

impl FileStat {
    pub fn is_finite(&self) -> bool {
        self.mtime.is_some() && self.size.is_some()
    }
}

struct CacheEntry {
    document: Value,
    stat: FileStat,
    est_bytes: usize,
}

/// Default maximum entry count, overridable by the store's configuration.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// The environment variable honored for a cache-size override (§6
/// "Environment inputs used by the core"). Any positive integer overrides
/// [`DEFAULT_CAPACITY`]; anything else (absent, non-numeric, zero) is
/// ignored and the default stands.
pub const CACHE_SIZE_ENV_VAR: &str = "DOCSTORE_CACHE_SIZE";

/// Resolves the cache capacity for a newly opened store: the environment
/// override if present and a positive integer, otherwise [`DEFAULT_CAPACITY`].
pub fn capacity_from_env() -> usize {
    std::env::var(CACHE_SIZE_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CAPACITY)
}

pub struct DocumentCache {
    capacity: usize,
    byte_budget: Option<usize>,
    entries: HashMap<String, CacheEntry>,
    access_order: Vec<String>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl DocumentCache {
    pub fn new(capacity: usize, byte_budget: Option<usize>) -> Self {
        Self {
            capacity,
            byte_budget,
            entries: HashMap::new(),
            access_order: Vec::new(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn normalize(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// Looks up `path`; a stat mismatch (or non-finite stat) evicts the
    /// entry and counts as a miss rather than a hit.
    pub fn get(&mut self, path: &Path, stat: FileStat) -> Option<Value> {
        let key = Self::normalize(path);
        if !stat.is_finite() {
            self.remove_key(&key);
            self.misses += 1;
            return None;
        }

        match self.entries.get(&key) {
            Some(entry) if entry.stat == stat => {
                let document = entry.document.clone();
                self.touch(&key);
                self.hits += 1;
                Some(document)
            }
            Some(_) => {
                self.remove_key(&key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts or replaces the entry for `path`. Rejected silently if
    /// `stat` is not finite: a cache entry with no valid invalidation key
    /// would never be evictable by change, so it must never be stored.
    pub fn set(&mut self, path: &Path, document: Value, stat: FileStat) {
        if !stat.is_finite() {
            return;
        }
        let key = Self::normalize(path);
        let est_bytes = estimate_bytes(&document);

        self.remove_key(&key);
        self.entries.insert(
            key.clone(),
            CacheEntry {
                document,
                stat,
                est_bytes,
            },
        );
        self.access_order.push(key);
        self.total_bytes += est_bytes;
        self.evict_to_bounds();
    }

    pub fn delete(&mut self, path: &Path) {
        let key = Self::normalize(path);
        self.remove_key(&key);
    }

    /// Removes every entry whose normalized path starts with
    /// `<root>/<entity_type>/`.
    pub fn clear_type(&mut self, root: &Path, entity_type: &str) {
        let prefix = Self::normalize(&root.join(entity_type)) + "/";
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            self.remove_key(&key);
        }
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.access_order.clear();
        self.total_bytes = 0;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn touch(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
        self.access_order.push(key.to_string());
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.est_bytes);
        }
        self.access_order.retain(|k| k != key);
    }

    fn evict_to_bounds(&mut self) {
        while self.entries.len() > self.capacity
            || self
                .byte_budget
                .is_some_and(|budget| self.total_bytes > budget)
        {
            if self.access_order.is_empty() {
                break;
            }
            let lru_key = self.access_order.remove(0);
            self.remove_key(&lru_key);
            self.evictions += 1;
        }
    }
}

fn estimate_bytes(document: &Value) -> usize {
    const OVERHEAD: usize = 64;
    serde_json::to_vec(document).map(|v| v.len()).unwrap_or(0) + OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn stat(mtime: i64, size: u64) -> FileStat {
        FileStat {
            mtime: Some(mtime),
            size: Some(size),
        }
    }

    #[test]
    fn hit_then_invalidate_on_stat_change() {
        let mut cache = DocumentCache::new(10, None);
        let path = PathBuf::from("/root/users/alice.json");
        cache.set(&path, json!({"id": "alice"}), stat(1, 10));
        assert!(cache.get(&path, stat(1, 10)).is_some());
        assert_eq!(cache.hits(), 1);

        assert!(cache.get(&path, stat(2, 10)).is_none());
        assert_eq!(cache.misses(), 1);
        assert!(cache.get(&path, stat(1, 10)).is_none());
    }

    #[test]
    fn non_finite_stat_is_treated_as_a_miss_and_evicts() {
        let mut cache = DocumentCache::new(10, None);
        let path = PathBuf::from("/root/users/alice.json");
        cache.set(&path, json!({"id": "alice"}), stat(1, 10));
        let non_finite = FileStat { mtime: None, size: Some(10) };
        assert!(cache.get(&path, non_finite).is_none());
        assert!(cache.get(&path, stat(1, 10)).is_none());
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let mut cache = DocumentCache::new(2, None);
        let a = PathBuf::from("/root/users/a.json");
        let b = PathBuf::from("/root/users/b.json");
        let c = PathBuf::from("/root/users/c.json");
        cache.set(&a, json!({"id": "a"}), stat(1, 1));
        cache.set(&b, json!({"id": "b"}), stat(1, 1));
        cache.get(&a, stat(1, 1));
        cache.set(&c, json!({"id": "c"}), stat(1, 1));

        assert!(cache.get(&b, stat(1, 1)).is_none());
        assert!(cache.get(&a, stat(1, 1)).is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn clear_type_removes_only_matching_prefix() {
        let mut cache = DocumentCache::new(10, None);
        let root = PathBuf::from("/root");
        cache.set(&root.join("users/alice.json"), json!({}), stat(1, 1));
        cache.set(&root.join("tasks/t1.json"), json!({}), stat(1, 1));

        cache.clear_type(&root, "users");

        assert!(cache.get(&root.join("users/alice.json"), stat(1, 1)).is_none());
        assert!(cache.get(&root.join("tasks/t1.json"), stat(1, 1)).is_some());
    }
}
