//! Bounded LRU cache for minted leaf certificates
//!
//! Lookup and insert run under a single mutex, so concurrent minting for the
//! same name resolves through [`CertCache::load_or_store`]: whichever insert
//! wins, every caller gets the surviving value.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Leaf certificates the proxy keeps before evicting the least recently
/// used entry.
pub(crate) const CERT_CACHE_CAP: usize = 128;

/// A fixed-capacity LRU map under one lock.
#[derive(Debug)]
pub struct CertCache<V> {
  inner: Mutex<LruCache<String, V>>,
}

impl<V: Clone> CertCache<V> {
  pub fn new(cap: usize) -> Self {
    let cap = NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN);
    Self {
      inner: Mutex::new(LruCache::new(cap)),
    }
  }

  /// Look up `key`, promoting it to most recently used.
  pub fn load(&self, key: &str) -> Option<V> {
    let mut cache = self.inner.lock().unwrap();
    cache.get(key).cloned()
  }

  /// Return the existing entry for `key` or insert `value`. The boolean is
  /// true when an existing entry won.
  pub fn load_or_store(&self, key: &str, value: V) -> (V, bool) {
    let mut cache = self.inner.lock().unwrap();
    if let Some(existing) = cache.get(key) {
      return (existing.clone(), true);
    }
    cache.put(key.to_string(), value.clone());
    (value, false)
  }

  /// Current length and fixed capacity.
  pub fn status(&self) -> (usize, usize) {
    let cache = self.inner.lock().unwrap();
    (cache.len(), cache.cap().get())
  }
}
