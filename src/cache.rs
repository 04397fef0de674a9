use crate::prelude::*;

use crate::lux::packet::DeviceFunction;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Identity of a read request. Writes are never fingerprinted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReadFingerprint {
    pub function: u8,
    pub start_register: u16,
    pub register_count: u16,
}

impl ReadFingerprint {
    pub fn new(function: DeviceFunction, start_register: u16, register_count: u16) -> Self {
        Self {
            function: function.into(),
            start_register,
            register_count,
        }
    }
}

impl std::fmt::Display for ReadFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "func=0x{:02X} start={} count={}",
            self.function, self.start_register, self.register_count
        )
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub response: Vec<u8>,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub hit_count: u32,
}

impl CacheEntry {
    fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.created_at) > ttl
    }
}

/// Snapshot of one entry for diagnostics.
#[derive(Clone, Debug)]
pub struct CacheEntryInfo {
    pub fingerprint: ReadFingerprint,
    pub age: Duration,
    pub hit_count: u32,
    pub size: usize,
}

/// Last-known-good responses for read requests, served when the bus cannot
/// answer. Stores fully encoded client frames, so a fallback reply is
/// bit-exact to the one the inverter previously produced.
pub struct FallbackCache {
    entries: BTreeMap<ReadFingerprint, CacheEntry>,
    max_entries: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

impl FallbackCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_entries,
            ttl,
            hits: 0,
            misses: 0,
            invalidations: 0,
        }
    }

    /// Store an encoded response, replacing any entry under the same key,
    /// then run maintenance: drop expired entries first, and if the table is
    /// still full evict the entry with the oldest creation time.
    pub fn put(&mut self, fingerprint: ReadFingerprint, response: Vec<u8>) {
        if self.entries.remove(&fingerprint).is_some() {
            self.invalidations += 1;
        }

        let now = Instant::now();

        let stale: Vec<ReadFingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_stale(now, self.ttl))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            debug!("cache: dropping stale entry {}", key);
            self.entries.remove(&key);
            self.invalidations += 1;
        }

        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        debug!("cache: stored {} ({} bytes)", fingerprint, response.len());
        self.entries.insert(
            fingerprint,
            CacheEntry {
                response,
                created_at: now,
                last_accessed_at: now,
                hit_count: 0,
            },
        );
    }

    /// Fetch a fallback response. A hit bumps the entry's hit counter and
    /// access time; an expired entry counts as a miss and is dropped.
    pub fn get(&mut self, fingerprint: &ReadFingerprint) -> Option<Vec<u8>> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(fingerprint) {
            if entry.is_stale(now, self.ttl) {
                debug!("cache: entry {} expired", fingerprint);
                self.entries.remove(fingerprint);
                self.invalidations += 1;
                self.misses += 1;
                return None;
            }
        }

        match self.entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.hit_count += 1;
                entry.last_accessed_at = now;
                self.hits += 1;
                info!(
                    "cache: serving fallback for {} (hit #{}, age {:?})",
                    fingerprint,
                    entry.hit_count,
                    now.duration_since(entry.created_at)
                );
                Some(entry.response.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.created_at)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            debug!("cache: evicting oldest entry {}", key);
            self.entries.remove(&key);
            self.invalidations += 1;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fingerprint: &ReadFingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    pub fn snapshot(&self) -> Vec<CacheEntryInfo> {
        let now = Instant::now();
        self.entries
            .iter()
            .map(|(k, e)| CacheEntryInfo {
                fingerprint: *k,
                age: now.duration_since(e.created_at),
                hit_count: e.hit_count,
                size: e.response.len(),
            })
            .collect()
    }
}
