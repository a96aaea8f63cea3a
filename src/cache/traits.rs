//! Core traits and types for the caching system.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::staged::{Stage, StageState};
use crate::error::{CacheError, Result};

/// Trait for values that can be cached in every tier.
///
/// Values travel through the fallback and durable tiers as JSON, so they must
/// round-trip through serde.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Value type name for storage organization (e.g., "repo_stats", "avatar")
  fn entity_type() -> &'static str;
}

/// Logical key of a cached value.
pub trait CacheKey: Clone + Send + Sync + 'static {
  /// Stable identifier used in every tier (e.g., "torvalds/linux/30/false").
  fn cache_key(&self) -> String;

  /// Human readable description for logs.
  fn description(&self) -> String {
    self.cache_key()
  }
}

/// The expensive data source behind a cache.
///
/// A fetcher declares which stages it runs; they are executed in
/// [`Stage`] order and must start with [`Stage::Critical`]. Each stage
/// returns a partial record that is merged field by field over the previous
/// ones, so a stage only fills the fields it owns. `prior` is the merged
/// record so far.
pub trait OriginFetcher<K: CacheKey>: Send + Sync + 'static {
  type Value: Cacheable;

  fn stages(&self) -> &[Stage] {
    &[Stage::Critical]
  }

  fn fetch_stage<'a>(
    &'a self,
    key: &'a K,
    stage: Stage,
    prior: Option<&'a Self::Value>,
  ) -> BoxFuture<'a, Result<Self::Value>>;

  /// Check a value from any tier before it is trusted.
  fn validate(&self, _key: &K, value: Self::Value) -> Result<Self::Value> {
    Ok(value)
  }

  /// Deterministic replacement for a value that failed validation.
  fn default_value(&self, _key: &K) -> Option<Self::Value> {
    None
  }
}

/// Which tier produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
  Memory,
  Durable,
  Fallback,
  Origin,
}

impl EntrySource {
  pub fn as_str(self) -> &'static str {
    match self {
      EntrySource::Memory => "memory",
      EntrySource::Durable => "durable",
      EntrySource::Fallback => "fallback",
      EntrySource::Origin => "origin",
    }
  }
}

impl std::fmt::Display for EntrySource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A cached value together with its freshness window.
///
/// `expires_at` is always strictly after `cached_at`. Entries are never
/// mutated: refreshing a key replaces its entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry<V>", bound(deserialize = "V: DeserializeOwned"))]
pub struct CacheEntry<V> {
  key: String,
  value: V,
  cached_at: DateTime<Utc>,
  expires_at: DateTime<Utc>,
  source: EntrySource,
}

#[derive(Deserialize)]
struct RawEntry<V> {
  key: String,
  value: V,
  cached_at: DateTime<Utc>,
  expires_at: DateTime<Utc>,
  source: EntrySource,
}

impl<V> TryFrom<RawEntry<V>> for CacheEntry<V> {
  type Error = CacheError;

  fn try_from(raw: RawEntry<V>) -> Result<Self> {
    Self::from_parts(raw.key, raw.value, raw.cached_at, raw.expires_at, raw.source)
  }
}

impl<V> CacheEntry<V> {
  /// Create an entry that stays valid for `ttl` after `cached_at`.
  ///
  /// A zero `ttl` is bumped to one millisecond so the window is never empty.
  pub fn new(
    key: impl Into<String>,
    value: V,
    cached_at: DateTime<Utc>,
    ttl: Duration,
    source: EntrySource,
  ) -> Self {
    let ttl = ttl.max(Duration::from_millis(1));
    Self {
      key: key.into(),
      value,
      cached_at,
      expires_at: add_duration(cached_at, ttl),
      source,
    }
  }

  /// Rebuild an entry from stored parts, rejecting an empty freshness window.
  pub fn from_parts(
    key: String,
    value: V,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    source: EntrySource,
  ) -> Result<Self> {
    if expires_at <= cached_at {
      return Err(CacheError::validation(format!(
        "entry {} expires at {} which is not after {}",
        key, expires_at, cached_at
      )));
    }
    Ok(Self {
      key,
      value,
      cached_at,
      expires_at,
      source,
    })
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn value(&self) -> &V {
    &self.value
  }

  pub fn into_value(self) -> V {
    self.value
  }

  pub fn cached_at(&self) -> DateTime<Utc> {
    self.cached_at
  }

  pub fn expires_at(&self) -> DateTime<Utc> {
    self.expires_at
  }

  pub fn source(&self) -> EntrySource {
    self.source
  }

  /// An entry is valid strictly before its expiry instant.
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now < self.expires_at
  }

  /// Time since the entry was cached. Zero if `now` is before `cached_at`.
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    (now - self.cached_at).to_std().unwrap_or_default()
  }

  /// Same value and window, relabelled with the tier it is now served from.
  pub fn with_source(self, source: EntrySource) -> Self {
    Self { source, ..self }
  }

  /// Same value, with the window shortened to end at most `max` after `from`.
  pub fn capped(self, from: DateTime<Utc>, max: Duration) -> Self {
    let cap = add_duration(from.max(self.cached_at), max.max(Duration::from_millis(1)));
    Self {
      expires_at: self.expires_at.min(cap),
      ..self
    }
  }

  /// Replace the value through a fallible conversion, keeping the window.
  pub fn try_map<U>(self, f: impl FnOnce(V) -> Result<U>) -> Result<CacheEntry<U>> {
    Ok(CacheEntry {
      key: self.key,
      value: f(self.value)?,
      cached_at: self.cached_at,
      expires_at: self.expires_at,
      source: self.source,
    })
  }
}

/// Add a std duration to a timestamp, saturating at the maximum timestamp.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(duration)
    .ok()
    .and_then(|d| at.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Options for a single lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
  /// Skip the cached tiers and go to the origin (still deduplicated).
  pub force_refresh: bool,
}

impl GetOptions {
  pub fn force_refresh() -> Self {
    Self {
      force_refresh: true,
    }
  }
}

/// Result from a cache lookup, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<V> {
  /// The actual data
  pub value: V,
  /// True when the value is past its freshness window, or was served from a
  /// slower tier while a fresher origin fetch may still be running.
  pub is_stale: bool,
  /// Where the data came from
  pub source: EntrySource,
  /// When the data was cached
  pub cached_at: DateTime<Utc>,
  /// Progress of the staged origin fetch for this key
  pub progress: StageState,
}

impl<V> CacheResult<V> {
  pub(crate) fn from_entry(entry: CacheEntry<V>, is_stale: bool, progress: StageState) -> Self {
    let source = entry.source();
    let cached_at = entry.cached_at();
    Self {
      value: entry.into_value(),
      is_stale,
      source,
      cached_at,
      progress,
    }
  }
}

/// Source of the current time. Injected so freshness can be tested.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
  }

  #[test]
  fn test_entry_valid_strictly_before_expiry() {
    let entry = CacheEntry::new("k", 1, at(0), Duration::from_secs(10), EntrySource::Origin);
    assert!(entry.is_valid(at(9)));
    assert!(!entry.is_valid(at(10)));
  }

  #[test]
  fn test_zero_ttl_still_has_window() {
    let entry = CacheEntry::new("k", 1, at(0), Duration::ZERO, EntrySource::Origin);
    assert!(entry.expires_at() > entry.cached_at());
  }

  #[test]
  fn test_deserialize_rejects_inverted_window() {
    let json = r#"{"key":"k","value":1,"cached_at":"2024-01-02T00:00:00Z","expires_at":"2024-01-01T00:00:00Z","source":"origin"}"#;
    let result: std::result::Result<CacheEntry<i32>, _> = serde_json::from_str(json);
    assert!(result.is_err());
  }

  #[test]
  fn test_capped_shortens_window() {
    let entry = CacheEntry::new("k", 1, at(0), Duration::from_secs(3600), EntrySource::Durable)
      .capped(at(100), Duration::from_secs(60));
    assert_eq!(entry.expires_at(), at(160));

    let entry = CacheEntry::new("k", 1, at(0), Duration::from_secs(30), EntrySource::Durable)
      .capped(at(0), Duration::from_secs(60));
    assert_eq!(entry.expires_at(), at(30));
  }
}
