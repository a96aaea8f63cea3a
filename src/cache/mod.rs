//! Tiered caching layer for expensive, rate-limited data sources.
//!
//! This module provides a source-agnostic caching mechanism that:
//! - Answers lookups from memory, a local fallback store, a durable store and
//!   finally the origin, in that order
//! - Runs at most one origin fetch per key at a time
//! - Delivers staged origin results as soon as the first stage is ready
//! - Bounds memory with age- and size-based eviction
//! - Writes origin results back to the durable store in debounced batches

mod batcher;
mod durable;
mod inflight;
mod layer;
mod memory;
mod settings;
mod staged;
mod storage;
mod task;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use batcher::{BatcherConfig, FlushReport, WriteBatcher};
pub use durable::{
  DurableRecord, DurableStore, KeyFilter, PostgrestStore, SqliteDurableStore, UpsertOutcome,
};
pub use inflight::{Claim, InFlightGuard};
pub use layer::{CacheLayer, LayerStats, Tiers};
pub use memory::{EvictionLimits, EvictionReport, Lookup, MemoryCache};
pub use settings::{CacheSettings, CacheSettingsPatch, FallbackPolicy};
pub use staged::{merge_fields, Stage, StageState};
pub use storage::{storage_key, KeyValueStore, NoopStorage, SqliteKvStore};
pub use task::DelayedTask;
pub use traits::{
  CacheEntry, CacheKey, CacheResult, Cacheable, Clock, EntrySource, GetOptions, OriginFetcher,
  SystemClock,
};
