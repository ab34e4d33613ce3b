//! Durable, fingerprint-keyed response cache.
//!
//! The cache is a performance optimisation only. Every storage fault is
//! logged and reported to the caller as a miss, so a broken or locked
//! cache database degrades to live fetches instead of failing rows.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use prospect_core::schema::{CacheEntry, CacheStats, Database};

use crate::error::EnrichResult;

const FINGERPRINT_VERSION: &str = "prospect-cache-v1";

/// Deterministic identity of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Lowercase and collapse internal whitespace.
#[must_use]
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The normalized identity of one upstream request: source, method and
/// parameters. Parameters are kept sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    source: String,
    method: String,
    params: BTreeMap<String, String>,
}

impl RequestKey {
    #[must_use]
    pub fn new(source: &str, method: &str) -> Self {
        Self {
            source: source.to_string(),
            method: method.to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Add a free-text parameter, normalized with [`normalize`].
    #[must_use]
    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), normalize(value));
        self
    }

    /// Add an identifier parameter: trimmed, otherwise kept verbatim.
    #[must_use]
    pub fn exact_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.trim().to_string());
        self
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// SHA-256 over the length-prefixed source, method and sorted parameters.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        let mut feed = |part: &str| {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        };
        feed(FINGERPRINT_VERSION);
        feed(&self.source);
        feed(&self.method);
        for (name, value) in &self.params {
            feed(name);
            feed(value);
        }
        Fingerprint(hasher.finalize().into())
    }
}

/// Backing storage for [`KeyedCache`].
pub trait CacheStore: Send + Sync + fmt::Debug {
    fn load(&self, fingerprint: &[u8]) -> prospect_core::Result<Option<CacheEntry>>;
    fn save(&self, entry: &CacheEntry) -> prospect_core::Result<()>;
    fn purge_expired(&self, now: DateTime<Utc>) -> prospect_core::Result<usize>;
    fn clear(&self) -> prospect_core::Result<usize>;
    fn stats(&self, now: DateTime<Utc>) -> prospect_core::Result<CacheStats>;
}

fn poisoned() -> prospect_core::Error {
    prospect_core::Error::InvalidData("cache lock poisoned".to_string())
}

/// SQLite-backed store; survives process restarts.
#[derive(Debug)]
pub struct SqliteCacheStore {
    db: Mutex<Database>,
}

impl SqliteCacheStore {
    pub fn open(path: impl AsRef<Path>) -> prospect_core::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            db: Mutex::new(Database::open(path)?),
        })
    }

    pub fn open_in_memory() -> prospect_core::Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_in_memory()?),
        })
    }
}

impl CacheStore for SqliteCacheStore {
    fn load(&self, fingerprint: &[u8]) -> prospect_core::Result<Option<CacheEntry>> {
        self.db.lock().map_err(|_| poisoned())?.get_cache_entry(fingerprint)
    }

    fn save(&self, entry: &CacheEntry) -> prospect_core::Result<()> {
        self.db.lock().map_err(|_| poisoned())?.put_cache_entry(entry)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> prospect_core::Result<usize> {
        self.db
            .lock()
            .map_err(|_| poisoned())?
            .purge_expired_cache_entries(now)
    }

    fn clear(&self) -> prospect_core::Result<usize> {
        self.db.lock().map_err(|_| poisoned())?.clear_cache_entries()
    }

    fn stats(&self, now: DateTime<Utc>) -> prospect_core::Result<CacheStats> {
        self.db.lock().map_err(|_| poisoned())?.cache_stats(now)
    }
}

/// Process-local store, for tests and one-off runs.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Vec<u8>, CacheEntry>>,
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, fingerprint: &[u8]) -> prospect_core::Result<Option<CacheEntry>> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(fingerprint).cloned())
    }

    fn save(&self, entry: &CacheEntry) -> prospect_core::Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> prospect_core::Result<usize> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }

    fn clear(&self) -> prospect_core::Result<usize> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    fn stats(&self, now: DateTime<Utc>) -> prospect_core::Result<CacheStats> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(CacheStats {
            entries: entries.len() as u64,
            expired: entries.values().filter(|e| e.is_expired(now)).count() as u64,
            bytes: entries.values().map(|e| e.value.len() as u64).sum(),
        })
    }
}

/// Hit, miss and fault counts observed by one [`KeyedCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub faults: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    faults: AtomicU64,
}

/// Fingerprint-keyed cache with per-entry time-to-live.
///
/// Expired entries read as absent; physical removal is left to
/// [`KeyedCache::purge_expired`]. Reads and writes never return errors.
#[derive(Debug, Clone)]
pub struct KeyedCache {
    store: Option<Arc<dyn CacheStore>>,
    counters: Arc<Counters>,
}

impl KeyedCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store: Some(store),
            counters: Arc::default(),
        }
    }

    /// A cache that stores nothing; every read is a miss.
    pub fn disabled() -> Self {
        Self {
            store: None,
            counters: Arc::default(),
        }
    }

    /// Open an on-disk cache, falling back to a disabled cache when the
    /// database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Self {
        match SqliteCacheStore::open(path.as_ref()) {
            Ok(store) => Self::new(Arc::new(store)),
            Err(e) => {
                log::warn!(
                    "Cache at {} unavailable, continuing without it: {}",
                    path.as_ref().display(),
                    e
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
        }
    }

    fn fault(&self, action: &str, error: &dyn fmt::Display) {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache {action} failed, treating as miss: {error}");
    }

    /// Look up a live value.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        let store = self.store.as_ref()?;
        let found = match store.load(fingerprint.as_bytes()) {
            Ok(entry) => entry.filter(|e| !e.is_expired(Utc::now())),
            Err(e) => {
                self.fault("read", &e);
                None
            }
        };
        let counter = if found.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found.map(|e| e.value)
    }

    /// Store a value for `ttl`. A zero TTL stores nothing.
    pub fn set(&self, fingerprint: &Fingerprint, source: &str, value: String, ttl: Duration) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if ttl.is_zero() {
            return;
        }
        let now = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            fingerprint: fingerprint.as_bytes().to_vec(),
            source: source.to_string(),
            value,
            created_at: now,
            expires_at,
        };
        if let Err(e) = store.save(&entry) {
            self.fault("write", &e);
        }
    }

    /// Typed lookup; an undecodable entry reads as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &RequestKey) -> Option<T> {
        let raw = self.get(&key.fingerprint())?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                self.fault("decode", &e);
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &RequestKey, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(&key.fingerprint(), key.source(), raw, ttl),
            Err(e) => self.fault("encode", &e),
        }
    }

    /// Return the cached value for `key`, or run `fetch` and cache its
    /// successful result. Failed fetches are never cached.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &RequestKey,
        ttl: Duration,
        fetch: F,
    ) -> EnrichResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EnrichResult<T>>,
    {
        if let Some(hit) = self.get_json(key) {
            return Ok(hit);
        }
        let value = fetch().await?;
        self.set_json(key, &value, ttl);
        Ok(value)
    }

    /// Physically remove expired entries.
    pub fn purge_expired(&self) -> prospect_core::Result<usize> {
        match &self.store {
            Some(store) => store.purge_expired(Utc::now()),
            None => Ok(0),
        }
    }

    pub fn clear(&self) -> prospect_core::Result<usize> {
        match &self.store {
            Some(store) => store.clear(),
            None => Ok(0),
        }
    }

    pub fn stats(&self) -> prospect_core::Result<CacheStats> {
        match &self.store {
            Some(store) => store.stats(Utc::now()),
            None => Ok(CacheStats::default()),
        }
    }
}
