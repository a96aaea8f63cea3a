//! Fetch orchestrator that resolves keys through the cache tiers.
//!
//! A lookup consults memory, the local fallback store, the durable store and
//! finally the origin, stopping at the first valid hit and writing results
//! forward into the faster tiers. Origin fetches are deduplicated per key and
//! may be staged: the first successful stage answers every waiting caller
//! while the remaining stages keep filling in the same entry.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{self, FutureExt};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::batcher::{FlushReport, WriteBatcher};
use super::durable::{DurableRecord, DurableStore, KeyFilter};
use super::inflight::InFlightGuard;
use super::memory::{Lookup, MemoryCache};
use super::settings::{CacheSettings, FallbackPolicy};
use super::staged::{merge_fields, Stage, StageState};
use super::storage::{storage_key, KeyValueStore, NoopStorage};
use super::traits::{
  CacheEntry, CacheKey, CacheResult, Cacheable, Clock, EntrySource, GetOptions, OriginFetcher,
  SystemClock,
};
use crate::error::{CacheError, Result};

/// The storage tiers and clock a [`CacheLayer`] runs against.
pub struct Tiers {
  pub kv: Arc<dyn KeyValueStore>,
  pub durable: Option<Arc<dyn DurableStore>>,
  pub clock: Arc<dyn Clock>,
}

impl Default for Tiers {
  fn default() -> Self {
    Self {
      kv: Arc::new(NoopStorage),
      durable: None,
      clock: Arc::new(SystemClock),
    }
  }
}

impl Tiers {
  pub fn with_kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
    self.kv = kv;
    self
  }

  pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
    self.durable = Some(durable);
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }
}

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
  pub name: String,
  pub resident: usize,
  pub in_flight: usize,
  pub pending_writes: usize,
  pub memory_hits: u64,
  pub fallback_hits: u64,
  pub durable_hits: u64,
  pub origin_fetches: u64,
  pub origin_failures: u64,
  pub stale_served: u64,
  pub durable_written: u64,
  pub durable_failed: u64,
}

#[derive(Default)]
struct Counters {
  memory_hits: AtomicU64,
  fallback_hits: AtomicU64,
  durable_hits: AtomicU64,
  origin_fetches: AtomicU64,
  origin_failures: AtomicU64,
  stale_served: AtomicU64,
}

fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

/// Cache orchestrator for one kind of value.
///
/// Cloning is cheap; clones share every tier.
pub struct CacheLayer<K: CacheKey, F: OriginFetcher<K>> {
  inner: Arc<LayerInner<K, F>>,
}

impl<K: CacheKey, F: OriginFetcher<K>> Clone for CacheLayer<K, F> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct LayerInner<K: CacheKey, F: OriginFetcher<K>> {
  name: String,
  settings: CacheSettings,
  fetcher: F,
  memory: Mutex<MemoryCache<F::Value>>,
  kv: Arc<dyn KeyValueStore>,
  durable: Option<Arc<dyn DurableStore>>,
  batcher: Option<WriteBatcher>,
  inflight: InFlightGuard<F::Value>,
  progress: Mutex<HashMap<String, StageState>>,
  clock: Arc<dyn Clock>,
  counters: Counters,
  _key: PhantomData<fn(K)>,
}

/// Outcome of the memory and fallback tiers for one key.
enum Local<V> {
  Hit(CacheResult<V>),
  Miss(Option<CacheEntry<V>>),
}

impl<K: CacheKey, F: OriginFetcher<K>> CacheLayer<K, F> {
  pub fn new(name: impl Into<String>, settings: CacheSettings, fetcher: F, tiers: Tiers) -> Self {
    let name = name.into();
    let batcher = tiers
      .durable
      .clone()
      .map(|store| WriteBatcher::new(name.clone(), store, settings.batcher_config()));
    Self {
      inner: Arc::new(LayerInner {
        memory: Mutex::new(MemoryCache::new(settings.eviction_limits())),
        name,
        settings,
        fetcher,
        kv: tiers.kv,
        durable: tiers.durable,
        batcher,
        inflight: InFlightGuard::new(),
        progress: Mutex::new(HashMap::new()),
        clock: tiers.clock,
        counters: Counters::default(),
        _key: PhantomData,
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.inner.settings
  }

  pub fn fetcher(&self) -> &F {
    &self.inner.fetcher
  }

  /// Resolve `key` through the tiers.
  ///
  /// Fails only when the origin fails and no tier holds any value for the
  /// key, not even an expired one.
  pub async fn get(&self, key: &K, options: GetOptions) -> Result<CacheResult<F::Value>> {
    let inner = &self.inner;
    let cache_key = key.cache_key();
    let mut last_known = None;

    if !options.force_refresh {
      match inner.resolve_local(key, &cache_key) {
        Local::Hit(result) => return Ok(result),
        Local::Miss(stale) => last_known = stale,
      }

      if let Some(entry) = inner.read_durable(key, &cache_key).await {
        match inner.accept_durable(entry) {
          Ok(result) => return Ok(result),
          Err(expired) => last_known = newest(last_known, Some(expired)),
        }
      }
    } else {
      debug!(cache = %inner.name, key = %cache_key, "Forced refresh, skipping cached tiers");
    }

    inner
      .resolve_origin(key, &cache_key, last_known, options.force_refresh)
      .await
  }

  /// Resolve several keys at once, answering in the order given.
  ///
  /// Keys missing from the local tiers are looked up with a single durable
  /// query; the rest go to the origin concurrently.
  pub async fn get_many(&self, keys: &[K]) -> Vec<Result<CacheResult<F::Value>>> {
    let inner = &self.inner;
    let mut results: Vec<Option<Result<CacheResult<F::Value>>>> = Vec::with_capacity(keys.len());
    let mut pending: Vec<(usize, String, Option<CacheEntry<F::Value>>)> = Vec::new();

    for (index, key) in keys.iter().enumerate() {
      let cache_key = key.cache_key();
      match inner.resolve_local(key, &cache_key) {
        Local::Hit(result) => results.push(Some(Ok(result))),
        Local::Miss(stale) => {
          results.push(None);
          pending.push((index, cache_key, stale));
        }
      }
    }

    if !pending.is_empty() {
      let wanted: Vec<String> = pending.iter().map(|(_, k, _)| k.clone()).collect();
      let mut found = inner.read_durable_many(wanted).await;
      let mut unresolved = Vec::new();
      for (index, cache_key, stale) in pending {
        let durable = found
          .remove(&cache_key)
          .and_then(|entry| inner.sanitize(&keys[index], entry));
        match durable.map(|entry| inner.accept_durable(entry)) {
          Some(Ok(result)) => results[index] = Some(Ok(result)),
          Some(Err(expired)) => unresolved.push((index, cache_key, newest(stale, Some(expired)))),
          None => unresolved.push((index, cache_key, stale)),
        }
      }

      let fetches = unresolved.into_iter().map(|(index, cache_key, stale)| {
        let key = &keys[index];
        async move {
          let result = inner.resolve_origin(key, &cache_key, stale, false).await;
          (index, result)
        }
      });
      for (index, result) in future::join_all(fetches).await {
        results[index] = Some(result);
      }
    }

    results
      .into_iter()
      .map(|r| r.unwrap_or_else(|| Err(CacheError::origin("key was not resolved"))))
      .collect()
  }

  /// Progress of the staged origin fetch for `key`.
  pub fn progress(&self, key: &K) -> StageState {
    self.inner.progress_of(&key.cache_key())
  }

  /// Whether an origin fetch for `key` is running.
  pub fn is_in_flight(&self, key: &K) -> bool {
    self.inner.inflight.is_in_flight(&key.cache_key())
  }

  /// Number of entries resident in memory.
  pub fn resident(&self) -> usize {
    self.inner.lock_memory().size()
  }

  /// The write batcher in front of the durable store, if one is configured.
  pub fn batcher(&self) -> Option<&WriteBatcher> {
    self.inner.batcher.as_ref()
  }

  pub fn stats(&self) -> LayerStats {
    let inner = &self.inner;
    let counters = &inner.counters;
    let (durable_written, durable_failed) = inner
      .batcher
      .as_ref()
      .map(|b| b.totals())
      .unwrap_or_default();
    LayerStats {
      name: inner.name.clone(),
      resident: inner.lock_memory().size(),
      in_flight: inner.inflight.len(),
      pending_writes: inner.batcher.as_ref().map(|b| b.pending_len()).unwrap_or(0),
      memory_hits: counters.memory_hits.load(Ordering::Relaxed),
      fallback_hits: counters.fallback_hits.load(Ordering::Relaxed),
      durable_hits: counters.durable_hits.load(Ordering::Relaxed),
      origin_fetches: counters.origin_fetches.load(Ordering::Relaxed),
      origin_failures: counters.origin_failures.load(Ordering::Relaxed),
      stale_served: counters.stale_served.load(Ordering::Relaxed),
      durable_written,
      durable_failed,
    }
  }

  /// Drop every memory entry and all stage progress.
  pub fn clear_memory(&self) {
    self.inner.lock_memory().clear();
    self.inner.lock_progress().clear();
  }

  /// Write buffered durable records now.
  pub async fn flush(&self) -> FlushReport {
    match &self.inner.batcher {
      Some(batcher) => batcher.flush().await,
      None => FlushReport::default(),
    }
  }

  /// Flush buffered durable records within `budget`.
  pub async fn shutdown(&self, budget: Duration) -> FlushReport {
    match &self.inner.batcher {
      Some(batcher) => batcher.shutdown(budget).await,
      None => FlushReport::default(),
    }
  }
}

impl<K: CacheKey, F: OriginFetcher<K>> LayerInner<K, F> {
  fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  fn lock_memory(&self) -> MutexGuard<'_, MemoryCache<F::Value>> {
    match self.memory.lock() {
      Ok(memory) => memory,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn lock_progress(&self) -> MutexGuard<'_, HashMap<String, StageState>> {
    match self.progress.lock() {
      Ok(progress) => progress,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn progress_of(&self, cache_key: &str) -> StageState {
    self
      .lock_progress()
      .get(cache_key)
      .copied()
      .unwrap_or_default()
  }

  fn set_progress(&self, cache_key: &str, state: StageState) {
    self.lock_progress().insert(cache_key.to_string(), state);
  }

  fn respond(&self, entry: CacheEntry<F::Value>, is_stale: bool) -> CacheResult<F::Value> {
    let progress = self.progress_of(entry.key());
    CacheResult::from_entry(entry, is_stale, progress)
  }

  fn fallback_key(&self, cache_key: &str) -> String {
    storage_key(<F::Value as Cacheable>::entity_type(), cache_key)
  }

  /// Memory then fallback. A miss carries any expired value seen on the way.
  fn resolve_local(self: &Arc<Self>, key: &K, cache_key: &str) -> Local<F::Value> {
    let now = self.now();
    let mut last_known = None;

    let lookup = self.lock_memory().lookup(cache_key, now);
    match lookup {
      Lookup::Fresh(entry) => {
        bump(&self.counters.memory_hits);
        debug!(cache = %self.name, key = %cache_key, "Memory hit");
        return Local::Hit(self.respond(entry.with_source(EntrySource::Memory), false));
      }
      Lookup::Expired(entry) => last_known = Some(entry.with_source(EntrySource::Memory)),
      Lookup::Missing => {}
    }

    if let Some(entry) = self.read_fallback(key, cache_key) {
      if entry.is_valid(now) {
        bump(&self.counters.fallback_hits);
        debug!(cache = %self.name, key = %cache_key, "Fallback hit");
        let served = self.remember(entry.clone(), now);
        self.reconcile(&entry, now);
        let in_flight = self.inflight.is_in_flight(cache_key);
        return Local::Hit(self.respond(served, in_flight));
      }
      match self.settings.fallback_policy {
        FallbackPolicy::TrustAndReconcile => {
          bump(&self.counters.fallback_hits);
          debug!(cache = %self.name, key = %cache_key, "Serving expired fallback value, refreshing");
          self.spawn_refresh(key.clone());
          return Local::Hit(self.respond(entry, true));
        }
        FallbackPolicy::Validate => last_known = newest(last_known, Some(entry)),
      }
    }

    debug!(cache = %self.name, key = %cache_key, "Local miss");
    Local::Miss(last_known)
  }

  /// Serve a durable entry if it is still valid, else hand it back as stale.
  fn accept_durable(
    &self,
    entry: CacheEntry<F::Value>,
  ) -> std::result::Result<CacheResult<F::Value>, CacheEntry<F::Value>> {
    let now = self.now();
    if !entry.is_valid(now) {
      return Err(entry);
    }
    bump(&self.counters.durable_hits);
    debug!(cache = %self.name, key = %entry.key(), "Durable hit");

    let served = self.remember(entry.clone(), now);
    if served.source() == EntrySource::Durable {
      self.write_fallback(&entry);
    }
    let in_flight = self.inflight.is_in_flight(entry.key());
    Ok(self.respond(served, in_flight))
  }

  /// Origin fetch, falling back to `last_known` on failure.
  async fn resolve_origin(
    self: &Arc<Self>,
    key: &K,
    cache_key: &str,
    last_known: Option<CacheEntry<F::Value>>,
    forced: bool,
  ) -> Result<CacheResult<F::Value>> {
    match self.fetch_origin(key).await {
      Ok(entry) => Ok(self.respond(entry, false)),
      Err(e) => {
        let last_known = match last_known {
          Some(entry) => Some(entry),
          None if forced => self.last_known(key, cache_key).await,
          None => None,
        };
        match last_known {
          Some(entry) => {
            bump(&self.counters.stale_served);
            warn!(
              cache = %self.name,
              key = %cache_key,
              error = %e,
              cached_at = %entry.cached_at(),
              "Origin failed, serving last known value",
            );
            Ok(self.respond(entry, true))
          }
          None => Err(e),
        }
      }
    }
  }

  /// Any value for the key, expired or not, from every cached tier.
  async fn last_known(&self, key: &K, cache_key: &str) -> Option<CacheEntry<F::Value>> {
    let memory = self
      .lock_memory()
      .peek(cache_key)
      .cloned()
      .map(|e| e.with_source(EntrySource::Memory));
    let fallback = self.read_fallback(key, cache_key);
    let durable = self.read_durable(key, cache_key).await;
    newest(newest(memory, fallback), durable)
  }

  /// Put an entry from a slower tier into memory unless memory already holds
  /// a fresher valid one, which is returned instead.
  fn remember(&self, entry: CacheEntry<F::Value>, now: DateTime<Utc>) -> CacheEntry<F::Value> {
    let mut memory = self.lock_memory();
    if memory.set_if_fresher(self.for_memory(entry.clone(), now), now) {
      drop(memory);
      self.maybe_evict(now);
      return entry;
    }
    match memory.peek(entry.key()) {
      Some(current) => current.clone().with_source(EntrySource::Memory),
      None => entry,
    }
  }

  fn for_memory(&self, entry: CacheEntry<F::Value>, now: DateTime<Utc>) -> CacheEntry<F::Value> {
    match self.settings.memory_ttl {
      Some(memory_ttl) => entry.capped(now, memory_ttl),
      None => entry,
    }
  }

  fn maybe_evict(&self, now: DateTime<Utc>) {
    let report = {
      let mut memory = self.lock_memory();
      if !memory.needs_cleanup() {
        return;
      }
      memory.evict(now)
    };
    debug!(
      cache = %self.name,
      stale = report.stale,
      overflow = report.overflow,
      "Evicted memory entries",
    );

    let mut progress = self.lock_progress();
    progress.retain(|key, _| {
      self.lock_memory().peek(key).is_some() || self.inflight.is_in_flight(key)
    });
  }

  /// Decode the fallback envelope for `cache_key`, expired or not.
  fn read_fallback(&self, key: &K, cache_key: &str) -> Option<CacheEntry<F::Value>> {
    let storage_key = self.fallback_key(cache_key);
    let raw = match self.kv.get(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(cache = %self.name, key = %cache_key, error = %e, "Fallback read failed");
        return None;
      }
    };
    let entry: CacheEntry<F::Value> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(cache = %self.name, key = %cache_key, error = %e, "Discarding unreadable fallback entry");
        if let Err(e) = self.kv.remove(&storage_key) {
          warn!(cache = %self.name, key = %cache_key, error = %e, "Fallback remove failed");
        }
        return None;
      }
    };
    if entry.key() != cache_key {
      return None;
    }
    self
      .sanitize(key, entry)
      .map(|e| e.with_source(EntrySource::Fallback))
  }

  fn write_fallback(&self, entry: &CacheEntry<F::Value>) {
    let raw = match serde_json::to_string(entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(cache = %self.name, key = %entry.key(), error = %e, "Could not encode fallback entry");
        return;
      }
    };
    if let Err(e) = self.kv.set(&self.fallback_key(entry.key()), &raw) {
      warn!(cache = %self.name, key = %entry.key(), error = %e, "Fallback write failed");
    }
  }

  async fn read_durable(&self, key: &K, cache_key: &str) -> Option<CacheEntry<F::Value>> {
    let store = self.durable.as_ref()?;
    let records = match store.query(KeyFilter::KeyEquals(cache_key.to_string())).await {
      Ok(records) => records,
      Err(e) => {
        warn!(cache = %self.name, key = %cache_key, store = store.name(), error = %e, "Durable read failed");
        return None;
      }
    };
    let record = records.into_iter().find(|r| r.cache_key == cache_key)?;
    match record.into_entry() {
      Ok(entry) => self.sanitize(key, entry),
      Err(e) => {
        warn!(cache = %self.name, key = %cache_key, error = %e, "Discarding malformed durable row");
        None
      }
    }
  }

  /// One `IN` query for many keys. Rows are decoded but not yet validated.
  async fn read_durable_many(&self, keys: Vec<String>) -> HashMap<String, CacheEntry<F::Value>> {
    let Some(store) = self.durable.as_ref() else {
      return HashMap::new();
    };
    let count = keys.len();
    let records = match store.query(KeyFilter::KeyIn(keys)).await {
      Ok(records) => records,
      Err(e) => {
        warn!(cache = %self.name, keys = count, store = store.name(), error = %e, "Durable batch read failed");
        return HashMap::new();
      }
    };
    let mut found = HashMap::new();
    for record in records {
      let cache_key = record.cache_key.clone();
      match record.into_entry() {
        Ok(entry) => {
          found.insert(cache_key, entry);
        }
        Err(e) => {
          warn!(cache = %self.name, key = %cache_key, error = %e, "Discarding malformed durable row");
        }
      }
    }
    found
  }

  /// Validate a value from any tier, substituting the fetcher's default.
  fn sanitize(&self, key: &K, entry: CacheEntry<F::Value>) -> Option<CacheEntry<F::Value>> {
    let (cache_key, cached_at, expires_at, source) = (
      entry.key().to_string(),
      entry.cached_at(),
      entry.expires_at(),
      entry.source(),
    );
    match entry.try_map(|value| self.fetcher.validate(key, value)) {
      Ok(entry) => Some(entry),
      Err(e) => {
        let default = self.fetcher.default_value(key)?;
        warn!(cache = %self.name, key = %cache_key, error = %e, "Replacing rejected value with default");
        CacheEntry::from_parts(cache_key, default, cached_at, expires_at, source).ok()
      }
    }
  }

  /// Queue a durable write for a value the durable tier may not have yet.
  fn reconcile(&self, entry: &CacheEntry<F::Value>, now: DateTime<Utc>) {
    let Some(batcher) = &self.batcher else {
      return;
    };
    match DurableRecord::from_entry(entry) {
      Ok(record) => batcher.enqueue(record, now),
      Err(e) => {
        warn!(cache = %self.name, key = %entry.key(), error = %e, "Could not encode durable record")
      }
    }
  }

  fn spawn_refresh(self: &Arc<Self>, key: K) {
    let inner = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = inner.fetch_origin(&key).await {
        debug!(cache = %inner.name, key = %key.description(), error = %e, "Background refresh failed");
      }
    });
  }

  /// Join or start the origin fetch for `key` and wait for its first stage.
  ///
  /// A caller joining a flight whose later stages already landed gets the
  /// merged record rather than the flight's first-stage result.
  async fn fetch_origin(self: &Arc<Self>, key: &K) -> Result<CacheEntry<F::Value>> {
    let cache_key = key.cache_key();
    let claim = self.inflight.claim(&cache_key, |flight| {
      let (tx, rx) = oneshot::channel();
      let inner = Arc::clone(self);
      let key = key.clone();
      tokio::spawn(async move { inner.run_stages(key, flight, tx).await });
      async move {
        rx.await
          .unwrap_or_else(|_| Err(CacheError::origin("origin fetch ended without a result")))
      }
      .boxed()
    });
    let entry = claim.into_future().await?;
    Ok(self.latest_published(entry))
  }

  /// The memory copy of an origin result when it is at least as recent.
  fn latest_published(&self, entry: CacheEntry<F::Value>) -> CacheEntry<F::Value> {
    let now = self.now();
    let memory = self.lock_memory();
    match memory.peek(entry.key()) {
      Some(current)
        if current.source() == EntrySource::Origin
          && current.is_valid(now)
          && current.cached_at() >= entry.cached_at() =>
      {
        current.clone()
      }
      _ => entry,
    }
  }

  /// Run every declared stage for `key`, publishing each success.
  ///
  /// `first` receives the first successful stage or the stage-1 failure. The
  /// in-flight guard is released once no stage is left to run.
  async fn run_stages(
    self: Arc<Self>,
    key: K,
    flight: u64,
    first: oneshot::Sender<Result<CacheEntry<F::Value>>>,
  ) {
    let cache_key = key.cache_key();
    let mut stages: Vec<Stage> = self.fetcher.stages().to_vec();
    stages.sort();
    stages.dedup();

    let previous = self.progress_of(&cache_key);
    let mut state = previous;
    let mut merged: Option<F::Value> = None;
    let mut first = Some(first);
    let mut failure = None;
    bump(&self.counters.origin_fetches);

    for stage in stages.iter().copied() {
      if stage == Stage::Enhancement && stages.contains(&Stage::Full) && state != StageState::Full {
        debug!(cache = %self.name, key = %cache_key, "Skipping enhancement after incomplete record");
        continue;
      }
      let Some(next) = state.begin(stage) else {
        continue;
      };
      state = next;
      self.set_progress(&cache_key, state);

      match self.run_stage(&key, stage, merged.as_ref()).await {
        Ok(value) => {
          merged = Some(value.clone());
          state = state.complete(stage);
          let entry = self.store_origin(&cache_key, value);
          self.set_progress(&cache_key, state);
          debug!(cache = %self.name, key = %cache_key, stage = %stage, "Stage ready");
          if let Some(tx) = first.take() {
            let _ = tx.send(Ok(entry));
          }
        }
        Err(e) if stage == Stage::Critical => {
          bump(&self.counters.origin_failures);
          warn!(cache = %self.name, key = %cache_key, error = %e, "Origin fetch failed");
          // A failed refresh leaves the data from an earlier fetch visible.
          state = if previous.has_data() { previous } else { state.fail() };
          failure = Some(e);
          break;
        }
        Err(e) => {
          warn!(cache = %self.name, key = %cache_key, stage = %stage, error = %e, "Stage failed, keeping earlier stages");
          state = state.fail();
          self.set_progress(&cache_key, state);
        }
      }
    }

    state = state.settle(&stages);
    self.set_progress(&cache_key, state);
    self.inflight.release(&cache_key, flight);
    if let Some(tx) = first.take() {
      let error =
        failure.unwrap_or_else(|| CacheError::origin(format!("no stage produced a value for {cache_key}")));
      let _ = tx.send(Err(error));
    }
    if merged.is_some() {
      info!(cache = %self.name, key = %key.description(), progress = ?state, "Origin fetch complete");
    }
  }

  /// One stage with its timeout, merged over the earlier stages and validated.
  async fn run_stage(&self, key: &K, stage: Stage, prior: Option<&F::Value>) -> Result<F::Value> {
    let timeout = self.settings.stage_timeout;
    let partial = match tokio::time::timeout(timeout, self.fetcher.fetch_stage(key, stage, prior)).await {
      Ok(result) => result?,
      Err(_) => {
        return Err(CacheError::Timeout {
          stage: stage.as_str(),
          after: timeout,
        })
      }
    };
    let value = match prior {
      Some(prior) => merge_fields(prior, &partial)?,
      None => partial,
    };
    match self.fetcher.validate(key, value) {
      Ok(value) => Ok(value),
      Err(e) => match self.fetcher.default_value(key) {
        Some(default) => {
          warn!(cache = %self.name, key = %key.description(), error = %e, "Replacing rejected origin value with default");
          Ok(default)
        }
        None => Err(e),
      },
    }
  }

  /// Write an origin value to memory and the fallback tier and queue it for
  /// the durable tier.
  fn store_origin(&self, cache_key: &str, value: F::Value) -> CacheEntry<F::Value> {
    let now = self.now();
    let entry = CacheEntry::new(cache_key, value, now, self.settings.ttl, EntrySource::Origin);
    self.lock_memory().set(self.for_memory(entry.clone(), now));
    self.maybe_evict(now);
    self.write_fallback(&entry);
    self.reconcile(&entry, now);
    entry
  }
}

/// The more recently cached of two optional entries.
fn newest<V>(a: Option<CacheEntry<V>>, b: Option<CacheEntry<V>>) -> Option<CacheEntry<V>> {
  match (a, b) {
    (Some(a), Some(b)) => Some(if b.cached_at() > a.cached_at() { b } else { a }),
    (a, b) => a.or(b),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteKvStore;
  use crate::cache::testing::{ManualClock, Probe, RecordingStore, ScriptedFetcher, TestKey};
  use crate::error::Tier;

  type TestLayer = CacheLayer<TestKey, ScriptedFetcher>;

  fn settings() -> CacheSettings {
    CacheSettings {
      ttl: Duration::from_secs(300),
      ..CacheSettings::repo_stats()
    }
  }

  struct Harness {
    layer: TestLayer,
    clock: Arc<ManualClock>,
    store: Arc<RecordingStore>,
    kv: Arc<SqliteKvStore>,
  }

  fn harness(fetcher: ScriptedFetcher, settings: CacheSettings) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(RecordingStore::new());
    let kv = Arc::new(SqliteKvStore::open_in_memory().unwrap());
    let tiers = Tiers::default()
      .with_kv(kv.clone())
      .with_durable(store.clone())
      .with_clock(clock.clone());
    Harness {
      layer: CacheLayer::new("test", settings, fetcher, tiers),
      clock,
      store,
      kv,
    }
  }

  fn key(k: &str) -> TestKey {
    TestKey::new(k)
  }

  fn durable_row(clock: &ManualClock, k: &str, probe: Probe, ttl: Duration) -> DurableRecord {
    let entry = CacheEntry::new(k, probe, clock.now(), ttl, EntrySource::Durable);
    DurableRecord::from_entry(&entry).unwrap()
  }

  #[tokio::test]
  async fn test_ttl_respected() {
    let h = harness(ScriptedFetcher::single(), settings());

    let first = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(first.source, EntrySource::Origin);
    assert_eq!(first.value, Probe::count(1));

    h.clock.advance(Duration::from_secs(299));
    let cached = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(cached.source, EntrySource::Memory);
    assert_eq!(cached.value, Probe::count(1));
    assert_eq!(h.layer.fetcher().calls(Stage::Critical), 1);

    h.clock.advance(Duration::from_secs(2));
    let refreshed = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(refreshed.source, EntrySource::Origin);
    assert_eq!(refreshed.value, Probe::count(2));
    assert_eq!(h.layer.fetcher().calls(Stage::Critical), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_gets_share_one_origin_call() {
    let fetcher = ScriptedFetcher::single();
    fetcher.script(Stage::Critical, Duration::from_millis(100), Ok(Probe::count(7)));
    let h = harness(fetcher, settings());

    let gets = (0..8).map(|_| {
      let layer = h.layer.clone();
      async move { layer.get(&key("a"), GetOptions::default()).await }
    });
    let results = future::join_all(gets).await;

    assert_eq!(h.layer.fetcher().calls(Stage::Critical), 1);
    for result in results {
      assert_eq!(result.unwrap().value, Probe::count(7));
    }
    assert!(!h.layer.is_in_flight(&key("a")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_later_stage_failure_keeps_stage_one() {
    let fetcher = ScriptedFetcher::new(&Stage::ALL);
    fetcher.script(Stage::Critical, Duration::ZERO, Ok(Probe::count(150)));
    fetcher.script(Stage::Full, Duration::from_millis(10), Err(CacheError::origin("boom")));
    let h = harness(fetcher, settings());

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(result.value.count, Some(150));
    assert!(!result.is_stale);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let again = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(again.value.count, Some(150));
    assert!(!again.is_stale);
    assert_eq!(h.layer.progress(&key("a")), StageState::Stage1Ready);
    assert_eq!(h.layer.fetcher().calls(Stage::Enhancement), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stages_merge_by_field() {
    let fetcher = ScriptedFetcher::new(&Stage::ALL);
    fetcher.script(Stage::Critical, Duration::ZERO, Ok(Probe::count(3)));
    fetcher.script(
      Stage::Full,
      Duration::from_millis(300),
      Ok(Probe {
        ratio: Some(0.5),
        ..Probe::default()
      }),
    );
    fetcher.script(
      Stage::Enhancement,
      Duration::from_millis(300),
      Ok(Probe {
        label: Some("extra".to_string()),
        ..Probe::default()
      }),
    );
    let h = harness(fetcher, settings());

    let first = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(first.value, Probe::count(3));
    assert_eq!(first.progress, StageState::Stage2Pending);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let full = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(full.value.ratio, Some(0.5));
    assert_eq!(full.value.count, Some(3));
    assert_eq!(full.progress, StageState::Stage3Pending);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let enhanced = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(enhanced.value.label.as_deref(), Some("extra"));
    assert_eq!(enhanced.value.count, Some(3));
    assert_eq!(h.layer.progress(&key("a")), StageState::Enhanced);
  }

  #[tokio::test(start_paused = true)]
  async fn test_joining_caller_sees_later_stages() {
    let fetcher = ScriptedFetcher::new(&Stage::ALL);
    fetcher.script(Stage::Critical, Duration::ZERO, Ok(Probe::count(3)));
    fetcher.script(
      Stage::Full,
      Duration::from_millis(100),
      Ok(Probe {
        ratio: Some(0.5),
        ..Probe::default()
      }),
    );
    fetcher.script(Stage::Enhancement, Duration::from_secs(20), Ok(Probe::default()));
    let h = harness(fetcher, settings());

    let first = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(first.value, Probe::count(3));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.layer.is_in_flight(&key("a")));
    let forced = h
      .layer
      .get(&key("a"), GetOptions::force_refresh())
      .await
      .unwrap();
    assert_eq!(forced.value.count, Some(3));
    assert_eq!(forced.value.ratio, Some(0.5));
    assert_eq!(forced.source, EntrySource::Origin);
    assert!(!forced.is_stale);
    assert_eq!(h.layer.fetcher().calls(Stage::Critical), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_stage_times_out_and_releases_guard() {
    let fetcher = ScriptedFetcher::new(&[Stage::Critical, Stage::Full]);
    fetcher.script(Stage::Full, Duration::from_secs(3600), Ok(Probe::default()));
    let settings = CacheSettings {
      stage_timeout: Duration::from_secs(5),
      ..settings()
    };
    let h = harness(fetcher, settings);

    h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert!(h.layer.is_in_flight(&key("a")));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!h.layer.is_in_flight(&key("a")));
    assert_eq!(h.layer.progress(&key("a")), StageState::Stage1Ready);
  }

  #[tokio::test]
  async fn test_origin_failure_without_cache_propagates() {
    let fetcher = ScriptedFetcher::single();
    fetcher.script(Stage::Critical, Duration::ZERO, Err(CacheError::origin("503")));
    let h = harness(fetcher, settings());

    let err = h
      .layer
      .get(&key("a"), GetOptions::default())
      .await
      .unwrap_err();
    assert!(err.is_origin_failure());
    assert_eq!(h.layer.progress(&key("a")), StageState::Failed);
  }

  #[tokio::test]
  async fn test_origin_failure_serves_expired_value() {
    let h = harness(ScriptedFetcher::single(), settings());
    h.layer.get(&key("a"), GetOptions::default()).await.unwrap();

    h.clock.advance(Duration::from_secs(600));
    h.layer
      .fetcher()
      .script(Stage::Critical, Duration::ZERO, Err(CacheError::origin("rate limited")));

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert!(result.is_stale);
    assert_eq!(result.value, Probe::count(1));
    assert_eq!(h.layer.progress(&key("a")), StageState::Full);
    assert_eq!(h.layer.stats().stale_served, 1);
  }

  #[tokio::test]
  async fn test_durable_hit_populates_faster_tiers() {
    let h = harness(ScriptedFetcher::single(), settings());
    h.store
      .insert(durable_row(&h.clock, "a", Probe::count(9), Duration::from_secs(60)));

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(result.source, EntrySource::Durable);
    assert_eq!(result.value, Probe::count(9));
    assert!(!result.is_stale);
    assert_eq!(h.layer.fetcher().calls(Stage::Critical), 0);

    let again = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(again.source, EntrySource::Memory);
    assert_eq!(h.store.query_calls(), 1);

    let raw = h
      .kv
      .get(&storage_key("probe", "a"))
      .unwrap()
      .expect("fallback envelope written");
    let envelope: CacheEntry<Probe> = serde_json::from_str(&raw).unwrap();
    assert_eq!(envelope.value(), &Probe::count(9));
  }

  #[tokio::test]
  async fn test_fallback_hit_queues_reconciliation() {
    let h = harness(ScriptedFetcher::single(), settings());
    let entry = CacheEntry::new(
      "a",
      Probe::count(4),
      h.clock.now(),
      Duration::from_secs(60),
      EntrySource::Origin,
    );
    h.kv
      .set(&storage_key("probe", "a"), &serde_json::to_string(&entry).unwrap())
      .unwrap();

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(result.source, EntrySource::Fallback);
    assert_eq!(result.value, Probe::count(4));
    assert_eq!(h.store.query_calls(), 0);
    assert!(h.layer.batcher().unwrap().is_pending("a"));
  }

  #[tokio::test]
  async fn test_expired_fallback_trusted_and_refreshed() {
    let settings = CacheSettings {
      fallback_policy: FallbackPolicy::TrustAndReconcile,
      ..settings()
    };
    let h = harness(ScriptedFetcher::single(), settings);
    let entry = CacheEntry::new(
      "a",
      Probe::count(4),
      h.clock.now(),
      Duration::from_secs(60),
      EntrySource::Origin,
    );
    h.kv
      .set(&storage_key("probe", "a"), &serde_json::to_string(&entry).unwrap())
      .unwrap();
    h.clock.advance(Duration::from_secs(120));

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(result.source, EntrySource::Fallback);
    assert!(result.is_stale);

    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    assert_eq!(h.layer.fetcher().calls(Stage::Critical), 1);
    let refreshed = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(refreshed.source, EntrySource::Memory);
    assert_eq!(refreshed.value, Probe::count(1));
  }

  #[tokio::test]
  async fn test_durable_failure_is_swallowed() {
    let h = harness(ScriptedFetcher::single(), settings());
    h.store.fail_queries.store(true, Ordering::SeqCst);

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(result.source, EntrySource::Origin);
    assert_eq!(h.store.query_calls(), 1);
  }

  #[tokio::test]
  async fn test_rejected_origin_value_replaced_by_default() {
    let fetcher = ScriptedFetcher::single();
    fetcher.script(
      Stage::Critical,
      Duration::ZERO,
      Ok(Probe {
        label: Some("bad".to_string()),
        ..Probe::default()
      }),
    );
    let h = harness(fetcher, settings());

    let result = h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    assert_eq!(result.value.label.as_deref(), Some("placeholder"));
    let queued = h.layer.batcher().unwrap().pending_record("a").unwrap();
    assert_eq!(queued.value["label"], "placeholder");
  }

  #[tokio::test]
  async fn test_force_refresh_skips_cached_tiers() {
    let h = harness(ScriptedFetcher::single(), settings());
    h.layer.get(&key("a"), GetOptions::default()).await.unwrap();

    let result = h.layer.get(&key("a"), GetOptions::force_refresh()).await.unwrap();
    assert_eq!(result.source, EntrySource::Origin);
    assert_eq!(result.value, Probe::count(2));
  }

  #[tokio::test]
  async fn test_get_many_batches_durable_lookup() {
    let h = harness(ScriptedFetcher::single(), settings());
    h.layer.get(&key("a"), GetOptions::default()).await.unwrap();
    h.store
      .insert(durable_row(&h.clock, "b", Probe::count(20), Duration::from_secs(60)));
    h.store
      .insert(durable_row(&h.clock, "c", Probe::count(30), Duration::from_secs(60)));
    let queries_before = h.store.query_calls();

    let results = h
      .layer
      .get_many(&[key("a"), key("b"), key("c"), key("d")])
      .await;

    let sources: Vec<EntrySource> = results.iter().map(|r| r.as_ref().unwrap().source).collect();
    assert_eq!(
      sources,
      vec![
        EntrySource::Memory,
        EntrySource::Durable,
        EntrySource::Durable,
        EntrySource::Origin
      ]
    );
    assert_eq!(h.store.query_calls() - queries_before, 1);
    assert_eq!(
      h.store.queries.lock().unwrap().last().unwrap(),
      &KeyFilter::KeyIn(vec!["b".to_string(), "c".to_string(), "d".to_string()])
    );
  }

  #[tokio::test]
  async fn test_memory_bounded_after_cleanup() {
    let settings = CacheSettings {
      max_entries: 3,
      cleanup_threshold: 4,
      ..settings()
    };
    let h = harness(ScriptedFetcher::single(), settings);

    for i in 0..6 {
      h.layer
        .get(&key(&format!("k{i}")), GetOptions::default())
        .await
        .unwrap();
      h.clock.advance(Duration::from_secs(1));
    }
    // Six inserts: the fifth crosses the threshold and trims to the three
    // newest, the sixth brings the count back to the threshold.
    assert_eq!(h.layer.resident(), 4);
    {
      let memory = h.layer.inner.lock_memory();
      for evicted in ["k0", "k1"] {
        assert!(memory.peek(evicted).is_none(), "{evicted} should be evicted");
      }
      for kept in ["k2", "k3", "k4", "k5"] {
        assert!(memory.peek(kept).is_some(), "{kept} should be resident");
      }
    }
    assert_eq!(h.layer.progress(&key("k0")), StageState::Empty);

    let stats = h.layer.stats();
    assert_eq!(stats.origin_fetches, 6);
    assert_eq!(stats.pending_writes, 6);
  }

  #[test]
  fn test_tier_error_display() {
    let err = CacheError::tier(Tier::Durable, "timeout");
    assert_eq!(err.to_string(), "durable tier unavailable: timeout");
  }
}
