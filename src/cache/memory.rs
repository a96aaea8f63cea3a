//! In-process memory tier with lazy expiry and two-pass eviction.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::traits::CacheEntry;

/// Size and age bounds for a memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionLimits {
  /// Resident entries kept after a cleanup.
  pub max_entries: usize,
  /// Cleanup runs once the resident count exceeds this.
  pub cleanup_threshold: usize,
  /// Entries older than this are dropped regardless of their expiry.
  pub hard_max_age: Duration,
}

/// Outcome of a memory lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
  Fresh(CacheEntry<V>),
  /// The entry had expired and was removed; it is handed back as a
  /// last-known value.
  Expired(CacheEntry<V>),
  Missing,
}

/// Counts of entries removed by [`MemoryCache::evict`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
  pub stale: usize,
  pub overflow: usize,
}

/// Map from cache key to entry. No I/O, no locking; the owner serializes access.
#[derive(Debug)]
pub struct MemoryCache<V> {
  entries: HashMap<String, CacheEntry<V>>,
  limits: EvictionLimits,
}

impl<V: Clone> MemoryCache<V> {
  pub fn new(limits: EvictionLimits) -> Self {
    Self {
      entries: HashMap::new(),
      limits,
    }
  }

  /// Get a valid entry. Expired entries are removed and reported as absent.
  pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<V>> {
    match self.lookup(key, now) {
      Lookup::Fresh(entry) => Some(entry),
      Lookup::Expired(_) | Lookup::Missing => None,
    }
  }

  /// Like [`get`](Self::get) but returns the removed entry when it had expired.
  pub fn lookup(&mut self, key: &str, now: DateTime<Utc>) -> Lookup<V> {
    match self.entries.get(key) {
      None => Lookup::Missing,
      Some(entry) if entry.is_valid(now) => Lookup::Fresh(entry.clone()),
      Some(_) => match self.entries.remove(key) {
        Some(entry) => Lookup::Expired(entry),
        None => Lookup::Missing,
      },
    }
  }

  /// Peek at an entry without expiry handling.
  pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
    self.entries.get(key)
  }

  /// Replace the entry for its key.
  pub fn set(&mut self, entry: CacheEntry<V>) {
    self.entries.insert(entry.key().to_string(), entry);
  }

  /// Store `entry` unless a still-valid entry cached at or after it is resident.
  ///
  /// Returns whether the entry was stored.
  pub fn set_if_fresher(&mut self, entry: CacheEntry<V>, now: DateTime<Utc>) -> bool {
    if let Some(current) = self.entries.get(entry.key()) {
      if current.is_valid(now) && current.cached_at() >= entry.cached_at() {
        return false;
      }
    }
    self.set(entry);
    true
  }

  pub fn size(&self) -> usize {
    self.entries.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  /// Whether the resident count has crossed the cleanup threshold.
  pub fn needs_cleanup(&self) -> bool {
    self.entries.len() > self.limits.cleanup_threshold
  }

  /// Drop entries older than the hard age, then the oldest entries until the
  /// resident count is back at `max_entries`.
  pub fn evict(&mut self, now: DateTime<Utc>) -> EvictionReport {
    let before = self.entries.len();
    let hard_max_age = self.limits.hard_max_age;
    self
      .entries
      .retain(|_, entry| entry.age(now) <= hard_max_age);
    let stale = before - self.entries.len();

    let mut overflow = 0;
    if self.entries.len() > self.limits.max_entries {
      let excess = self.entries.len() - self.limits.max_entries;
      let mut by_age: Vec<(DateTime<Utc>, String)> = self
        .entries
        .iter()
        .map(|(key, entry)| (entry.cached_at(), key.clone()))
        .collect();
      by_age.sort();

      for (_, key) in by_age.into_iter().take(excess) {
        self.entries.remove(&key);
        overflow += 1;
      }
    }

    EvictionReport { stale, overflow }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::EntrySource;

  fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
  }

  fn limits(max_entries: usize, cleanup_threshold: usize) -> EvictionLimits {
    EvictionLimits {
      max_entries,
      cleanup_threshold,
      hard_max_age: Duration::from_secs(30 * 60),
    }
  }

  fn entry(key: &str, cached_at: DateTime<Utc>, ttl_secs: u64) -> CacheEntry<u32> {
    CacheEntry::new(
      key,
      7,
      cached_at,
      Duration::from_secs(ttl_secs),
      EntrySource::Origin,
    )
  }

  #[test]
  fn test_get_removes_expired_entry() {
    let mut cache = MemoryCache::new(limits(20, 25));
    cache.set(entry("a", at(0), 300));

    assert!(cache.get("a", at(299)).is_some());
    assert!(cache.get("a", at(300)).is_none());
    assert_eq!(cache.size(), 0);
  }

  #[test]
  fn test_lookup_hands_back_expired_entry() {
    let mut cache = MemoryCache::new(limits(20, 25));
    cache.set(entry("a", at(0), 10));

    match cache.lookup("a", at(11)) {
      Lookup::Expired(e) => assert_eq!(e.key(), "a"),
      other => panic!("expected expired entry, got {:?}", other),
    }
    assert_eq!(cache.lookup("a", at(11)), Lookup::Missing);
  }

  #[test]
  fn test_eviction_bound_keeps_newest() {
    let max = 20;
    let extra = 7;
    let mut cache = MemoryCache::new(limits(max, 25));
    for i in 0..(max + extra) {
      cache.set(entry(&format!("k{i}"), at(i as i64), 3600));
    }

    let report = cache.evict(at(60));
    assert_eq!(report.overflow, extra);
    assert_eq!(cache.size(), max);
    for i in 0..extra {
      assert!(cache.peek(&format!("k{i}")).is_none());
    }
    for i in extra..(max + extra) {
      assert!(cache.peek(&format!("k{i}")).is_some());
    }
  }

  #[test]
  fn test_stale_pass_runs_before_size_pass() {
    let mut cache = MemoryCache::new(limits(2, 2));
    // Long-lived entry whose expiry would keep it around, but it is past the hard age.
    cache.set(entry("old", at(0), 24 * 3600));
    cache.set(entry("b", at(2000), 3600));
    cache.set(entry("c", at(2001), 3600));

    let report = cache.evict(at(2002));
    assert_eq!(report, EvictionReport { stale: 1, overflow: 0 });
    assert!(cache.peek("old").is_none());
    assert_eq!(cache.size(), 2);
  }

  #[test]
  fn test_needs_cleanup_above_threshold_only() {
    let mut cache = MemoryCache::new(limits(2, 3));
    for i in 0..3 {
      cache.set(entry(&format!("k{i}"), at(i), 60));
    }
    assert!(!cache.needs_cleanup());
    cache.set(entry("k3", at(3), 60));
    assert!(cache.needs_cleanup());
  }

  #[test]
  fn test_set_if_fresher_keeps_newer_valid_entry() {
    let mut cache = MemoryCache::new(limits(20, 25));
    cache.set(entry("a", at(100), 300));

    assert!(!cache.set_if_fresher(entry("a", at(50), 300), at(120)));
    assert_eq!(cache.peek("a").unwrap().cached_at(), at(100));

    // Once the resident entry has expired, an older-but-valid one may replace it.
    assert!(cache.set_if_fresher(entry("a", at(350), 300), at(450)));
    assert_eq!(cache.peek("a").unwrap().cached_at(), at(350));
  }
}
