//! # Result Cache
//!
//! Get/put memoization behind a trait so the pipeline behaves the same whether a cache is
//! present ([`MemoryCache`]) or disabled ([`NoCache`]). Keys are `"<stage>:" + sha256` of the
//! JSON encoding of the stage's key fields; values are JSON bytes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

/// Hit/miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub entries: usize,
  pub bytes: usize,
  pub capacity_bytes: usize,
}

impl CacheStats {
  pub fn hit_ratio(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

pub trait ResultCache: Send + Sync {
  fn get(&self, key: &str) -> Option<Vec<u8>>;

  fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);

  fn stats(&self) -> CacheStats {
    CacheStats::default()
  }
}

/// Always misses.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl ResultCache for NoCache {
  fn get(&self, _key: &str) -> Option<Vec<u8>> {
    None
  }

  fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) {}
}

#[derive(Debug)]
struct Entry {
  expires: Instant,
  seq: u64,
  value: Vec<u8>,
}

#[derive(Debug, Default)]
struct Entries {
  map: HashMap<String, Entry>,
  /// Insertion order, oldest first.
  order: BTreeMap<u64, String>,
  bytes: usize,
  next_seq: u64,
}

impl Entries {
  fn remove(&mut self, key: &str) {
    if let Some(entry) = self.map.remove(key) {
      self.order.remove(&entry.seq);
      self.bytes -= entry.value.len();
    }
  }

  fn sweep_expired(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .map
      .iter()
      .filter(|(_, e)| e.expires <= now)
      .map(|(k, _)| k.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    expired.len()
  }

  fn evict_oldest(&mut self) -> bool {
    let Some((_, key)) = self.order.pop_first() else {
      return false;
    };
    if let Some(entry) = self.map.remove(&key) {
      self.bytes -= entry.value.len();
    }
    true
  }
}

/// In-process TTL map bounded by the total size of its values.
///
/// Expired entries are swept on every `put`; when the byte budget is exceeded the oldest
/// insertions are evicted first.
#[derive(Debug)]
pub struct MemoryCache {
  entries: Mutex<Entries>,
  capacity_bytes: usize,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl Default for MemoryCache {
  fn default() -> Self {
    Self::with_capacity(DEFAULT_CAPACITY_BYTES)
  }
}

/// Default value budget of [`MemoryCache::new`].
pub const DEFAULT_CAPACITY_BYTES: usize = 256 * 1024 * 1024;

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity_bytes: usize) -> Self {
    Self {
      entries: Mutex::new(Entries::default()),
      capacity_bytes,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }
}

impl ResultCache for MemoryCache {
  fn get(&self, key: &str) -> Option<Vec<u8>> {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let found = match entries.map.get(key) {
      Some(entry) if entry.expires > Instant::now() => Some(entry.value.clone()),
      Some(_) => {
        entries.remove(key);
        None
      }
      None => None,
    };
    let counter = if found.is_some() { &self.hits } else { &self.misses };
    counter.fetch_add(1, Ordering::Relaxed);
    found
  }

  fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
    let now = Instant::now();
    let Some(expires) = now.checked_add(ttl) else {
      return;
    };
    if value.len() > self.capacity_bytes {
      debug!(key, size = value.len(), capacity = self.capacity_bytes, "value larger than cache, not stored");
      return;
    }

    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let swept = entries.sweep_expired(now);
    entries.remove(key);

    let mut evicted = 0;
    while entries.bytes + value.len() > self.capacity_bytes && entries.evict_oldest() {
      evicted += 1;
    }
    if swept + evicted > 0 {
      debug!(swept, evicted, bytes = entries.bytes, "cache pruned");
    }

    let seq = entries.next_seq;
    entries.next_seq += 1;
    entries.bytes += value.len();
    entries.order.insert(seq, key.to_string());
    entries.map.insert(key.to_string(), Entry { expires, seq, value });
  }

  fn stats(&self) -> CacheStats {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      entries: entries.map.len(),
      bytes: entries.bytes,
      capacity_bytes: self.capacity_bytes,
    }
  }
}

/// Deterministic key for `fields` under `stage`. `None` if the fields cannot be encoded.
pub fn cache_key<T: Serialize + ?Sized>(stage: &str, fields: &T) -> Option<String> {
  let bytes = serde_json::to_vec(fields).ok()?;
  let digest = Sha256::digest(&bytes);
  Some(format!("{stage}:{}", hex::encode(digest)))
}

pub fn get_json<T: DeserializeOwned>(cache: &dyn ResultCache, key: &str) -> Option<T> {
  let bytes = cache.get(key)?;
  match serde_json::from_slice(&bytes) {
    Ok(v) => {
      debug!(key, "cache hit");
      Some(v)
    }
    Err(err) => {
      warn!(key, error = %err, "discarding undecodable cache entry");
      None
    }
  }
}

pub fn put_json<T: Serialize + ?Sized>(cache: &dyn ResultCache, key: &str, value: &T, ttl: Duration) {
  match serde_json::to_vec(value) {
    Ok(bytes) => cache.put(key, bytes, ttl),
    Err(err) => warn!(key, error = %err, "value not cacheable"),
  }
}
