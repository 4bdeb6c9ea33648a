//! TTL + LRU result cache with single-flight computation.
//!
//! Expiry uses `tokio::time::Instant`, so paused-clock tests control it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::fingerprint::Fingerprint;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

struct CacheInner<V> {
    entries: HashMap<Fingerprint, CacheEntry<V>>,
    /// Least recently used first.
    order: Vec<Fingerprint>,
    /// Computations in progress. Dropping the sender wakes every waiter.
    in_flight: HashMap<Fingerprint, watch::Sender<()>>,
    hits: u64,
    misses: u64,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, fp: &Fingerprint) {
        if let Some(pos) = self.order.iter().position(|k| k == fp) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }

    fn remove(&mut self, fp: &Fingerprint) {
        self.entries.remove(fp);
        self.order.retain(|k| k != fp);
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    #[serde(rename = "maxEntries")]
    pub max_entries: usize,
    #[serde(rename = "inFlight")]
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe result cache keyed by [`Fingerprint`].
pub struct ResultCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_entries: usize,
}

enum Lookup<V> {
    Hit(V),
    Wait(watch::Receiver<()>),
    Lead(watch::Sender<()>),
}

/// Removes the in-flight marker when the leader finishes or is dropped.
struct FlightGuard<'a, V> {
    cache: &'a ResultCache<V>,
    fp: &'a Fingerprint,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        self.cache.inner.lock().in_flight.remove(self.fp);
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(max_entries.min(1024)),
                order: Vec::new(),
                in_flight: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            max_entries,
        }
    }

    /// Cached value for `fp`, or `None` on miss. Expired entries count as a
    /// miss and are dropped.
    pub fn get(&self, fp: &Fingerprint) -> Option<V> {
        let mut inner = self.inner.lock();
        let value = Self::lookup(&mut inner, fp);
        match value {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        value
    }

    /// Store `value` under `fp` for `ttl`, evicting the least recently used
    /// entry when full.
    pub fn put(&self, fp: Fingerprint, value: V, ttl: Duration) {
        let mut inner = self.inner.lock();
        self.insert(&mut inner, fp, value, ttl);
    }

    /// Return the cached value, or run `compute` and cache its `Ok` output.
    ///
    /// At most one computation per fingerprint runs at a time; concurrent
    /// callers wait for it and then read the stored value. Errors are not
    /// cached, so waiters retry the computation themselves. The boolean is
    /// `true` when the value came from the cache.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fp: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let sender = loop {
            let step = {
                let mut inner = self.inner.lock();
                if let Some(value) = Self::lookup(&mut inner, fp) {
                    inner.hits += 1;
                    Lookup::Hit(value)
                } else if let Some(tx) = inner.in_flight.get(fp) {
                    Lookup::Wait(tx.subscribe())
                } else {
                    inner.misses += 1;
                    let (tx, _rx) = watch::channel(());
                    inner.in_flight.insert(fp.clone(), tx.clone());
                    Lookup::Lead(tx)
                }
            };
            match step {
                Lookup::Hit(value) => return Ok((value, true)),
                Lookup::Wait(mut rx) => {
                    debug!("Waiting on in-flight computation {}", fp.short());
                    // Errors once the leader's sender is gone, which is the signal.
                    let _ = rx.changed().await;
                }
                Lookup::Lead(tx) => break tx,
            }
        };

        let guard = FlightGuard { cache: self, fp };
        let outcome = compute().await;
        if let Ok(value) = &outcome {
            let mut inner = self.inner.lock();
            self.insert(&mut inner, fp.clone(), value.clone(), ttl);
        }
        drop(guard);
        drop(sender);
        outcome.map(|value| (value, false))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for fp in &expired {
            inner.remove(fp);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            max_entries: self.max_entries,
            in_flight: inner.in_flight.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    fn lookup(inner: &mut CacheInner<V>, fp: &Fingerprint) -> Option<V> {
        let expired = inner
            .entries
            .get(fp)
            .map(|e| e.expires_at <= Instant::now())?;
        if expired {
            inner.remove(fp);
            return None;
        }
        inner.touch(fp);
        inner.entries.get(fp).map(|e| e.value.clone())
    }

    fn insert(&self, inner: &mut CacheInner<V>, fp: Fingerprint, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if inner.entries.contains_key(&fp) {
            inner.entries.insert(fp.clone(), entry);
            inner.touch(&fp);
            return;
        }
        while inner.entries.len() >= self.max_entries && !inner.order.is_empty() {
            let oldest = inner.order.remove(0);
            inner.entries.remove(&oldest);
        }
        inner.order.push(fp.clone());
        inner.entries.insert(fp, entry);
    }
}
