//! Result cache for deterministic executions
//!
//! Entries live in a `DashMap`, so reads and writes of one key are
//! serialized on that key's shard while other keys proceed concurrently.
//! Eviction is FIFO by insertion: an overwrite re-inserts the key at the
//! back of the queue, and reads never reorder it.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::sandbox::{ExecutionRequest, ExecutionResult};

/// Fingerprint of the inputs that determine an execution's output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key over language, code, args, stdin and env. Limits and timeouts are
    /// not part of the key; they bound a run without changing its output.
    pub fn for_request(request: &ExecutionRequest) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, request.language.to_string().as_bytes());
        feed(&mut hasher, request.code.as_bytes());

        hasher.update((request.args.len() as u64).to_le_bytes());
        for arg in &request.args {
            feed(&mut hasher, arg.as_bytes());
        }

        match &request.stdin {
            Some(stdin) => {
                hasher.update([1u8]);
                feed(&mut hasher, stdin.as_bytes());
            }
            None => hasher.update([0u8]),
        }

        // BTreeMap iterates in key order
        hasher.update((request.env.len() as u64).to_le_bytes());
        for (key, value) in &request.env {
            feed(&mut hasher, key.as_bytes());
            feed(&mut hasher, value.as_bytes());
        }

        CacheKey(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently
fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// A stored result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: ExecutionResult,
    pub created_at: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    seq: u64,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

/// Execution result cache
pub struct ExecutionCache {
    config: CacheConfig,
    entries: DashMap<CacheKey, CacheEntry>,
    /// Insertion order; records whose seq no longer matches the entry are stale
    order: Mutex<VecDeque<(CacheKey, u64)>>,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl ExecutionCache {
    pub fn new(config: CacheConfig) -> Self {
        ExecutionCache {
            config,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stored result for `key`, unless missing or past its TTL
    pub fn get(&self, key: &CacheKey) -> Option<ExecutionResult> {
        if !self.config.enabled {
            return None;
        }

        let stale = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result.clone());
            }
            Some(_) => true,
            None => false,
        };

        if stale && self.entries.remove_if(key, |_, e| e.is_expired()).is_some() {
            self.expired.fetch_add(1, Ordering::Relaxed);
            debug!("Purged expired cache entry {}", key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite, evicting the oldest insertions beyond `max_size`
    pub fn put(&self, key: CacheKey, result: ExecutionResult, ttl: Duration) {
        if !self.config.enabled || self.config.max_size == 0 {
            return;
        }

        let mut order = self.order.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                result,
                created_at: Instant::now(),
                ttl,
                access_count: 0,
                seq,
            },
        );
        order.push_back((key, seq));

        while self.entries.len() > self.config.max_size {
            let Some((oldest, oldest_seq)) = order.pop_front() else {
                break;
            };
            if self
                .entries
                .remove_if(&oldest, |_, e| e.seq == oldest_seq)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted cache entry {}", oldest);
            }
        }

        if order.len() > self.config.max_size.saturating_mul(2) {
            order.retain(|(k, s)| self.entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    /// Insert with the configured default TTL
    pub fn put_with_default_ttl(&self, key: CacheKey, result: ExecutionResult) {
        self.put(key, result, self.config.default_ttl);
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let purged = before.saturating_sub(self.entries.len());
        self.expired.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Read an entry without counting a hit
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_size: self.config.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Language, RawOutcome};
    use uuid::Uuid;

    fn cache(max_size: usize) -> ExecutionCache {
        ExecutionCache::new(CacheConfig {
            enabled: true,
            max_size,
            default_ttl: Duration::from_secs(60),
        })
    }

    fn result(stdout: &str) -> ExecutionResult {
        ExecutionResult::from_outcome(
            Uuid::new_v4(),
            "worker-0001".to_string(),
            RawOutcome::success(stdout, Duration::from_millis(5)),
        )
    }

    fn key(code: &str) -> CacheKey {
        CacheKey::for_request(&ExecutionRequest::new(code, Language::Python))
    }

    #[test]
    fn test_key_covers_inputs() {
        let base = ExecutionRequest::new("print(1)", Language::Python);
        let same = ExecutionRequest::new("print(1)", Language::Python)
            .with_timeout(Duration::from_secs(1));
        assert_eq!(CacheKey::for_request(&base), CacheKey::for_request(&same));

        let variants = [
            ExecutionRequest::new("print(1)", Language::Ruby),
            base.clone().with_arg("x"),
            base.clone().with_stdin(""),
            base.clone().with_env("A", "1"),
        ];
        for variant in &variants {
            assert_ne!(CacheKey::for_request(&base), CacheKey::for_request(variant));
        }

        let split_a = ExecutionRequest::new("x", Language::Bash).with_arg("ab").with_arg("c");
        let split_b = ExecutionRequest::new("x", Language::Bash).with_arg("a").with_arg("bc");
        assert_ne!(CacheKey::for_request(&split_a), CacheKey::for_request(&split_b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_respects_ttl() {
        let cache = cache(10);
        let stored = result("hello");
        cache.put(key("a"), stored.clone(), Duration::from_secs(5));

        assert_eq!(cache.get(&key("a")), Some(stored));
        assert_eq!(cache.peek(&key("a")).unwrap().access_count, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&key("a")), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_fifo_eviction_ignores_reads() {
        let cache = cache(2);
        cache.put_with_default_ttl(key("a"), result("a"));
        cache.put_with_default_ttl(key("b"), result("b"));

        // Reading "a" does not protect it
        assert!(cache.get(&key("a")).is_some());
        cache.put_with_default_ttl(key("c"), result("c"));

        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_moves_key_to_back() {
        let cache = cache(2);
        cache.put_with_default_ttl(key("a"), result("a1"));
        cache.put_with_default_ttl(key("b"), result("b"));
        cache.put_with_default_ttl(key("a"), result("a2"));
        cache.put_with_default_ttl(key("c"), result("c"));

        assert!(cache.get(&key("b")).is_none());
        assert_eq!(cache.get(&key("a")).unwrap().stdout, "a2");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_order_queue_compacts() {
        let cache = cache(2);
        for i in 0..50 {
            cache.put_with_default_ttl(key("same"), result(&i.to_string()));
        }
        assert!(cache.order.lock().len() <= 4);
        assert_eq!(cache.get(&key("same")).unwrap().stdout, "49");
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache(10);
        cache.put(key("short"), result("s"), Duration::from_secs(1));
        cache.put(key("long"), result("l"), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = ExecutionCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.put_with_default_ttl(key("a"), result("a"));
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
    }
}
