//! Per-instance cache tuning.

use std::time::Duration;

use serde::Deserialize;

use super::batcher::BatcherConfig;
use super::memory::EvictionLimits;

/// How the orchestrator treats a value found in the local fallback tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
  /// Use the value only while its envelope is unexpired.
  #[default]
  Validate,
  /// Use any stored value right away; refresh it in the background if expired.
  TrustAndReconcile,
}

/// Freshness, eviction, staging and write-batching parameters for one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
  /// Freshness window of an origin result.
  pub ttl: Duration,
  /// Shorter window applied to entries held in memory, if any.
  pub memory_ttl: Option<Duration>,
  /// Memory entries older than this are evicted regardless of `ttl`.
  pub hard_max_age: Duration,
  pub max_entries: usize,
  pub cleanup_threshold: usize,
  /// Upper bound for each origin stage.
  pub stage_timeout: Duration,
  pub debounce: Duration,
  pub batch_size: usize,
  pub fallback_policy: FallbackPolicy,
}

impl CacheSettings {
  /// Defaults for repository statistics.
  pub fn repo_stats() -> Self {
    Self {
      ttl: Duration::from_secs(5 * 60),
      memory_ttl: None,
      hard_max_age: Duration::from_secs(30 * 60),
      max_entries: 20,
      cleanup_threshold: 25,
      stage_timeout: Duration::from_secs(30),
      debounce: Duration::from_secs(1),
      batch_size: 100,
      fallback_policy: FallbackPolicy::Validate,
    }
  }

  /// Defaults for contributor avatars.
  pub fn avatars() -> Self {
    Self {
      ttl: Duration::from_secs(7 * 24 * 60 * 60),
      memory_ttl: Some(Duration::from_secs(5 * 60)),
      hard_max_age: Duration::from_secs(30 * 60),
      max_entries: 500,
      cleanup_threshold: 500,
      stage_timeout: Duration::from_secs(30),
      debounce: Duration::from_secs(1),
      batch_size: 100,
      fallback_policy: FallbackPolicy::TrustAndReconcile,
    }
  }

  pub fn eviction_limits(&self) -> EvictionLimits {
    EvictionLimits {
      max_entries: self.max_entries,
      cleanup_threshold: self.cleanup_threshold.max(self.max_entries),
      hard_max_age: self.hard_max_age,
    }
  }

  pub fn batcher_config(&self) -> BatcherConfig {
    BatcherConfig {
      debounce: self.debounce,
      batch_size: self.batch_size,
    }
  }
}

/// Partial settings as read from a config file; unset fields keep defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettingsPatch {
  #[serde(default, with = "humantime_serde")]
  pub ttl: Option<Duration>,
  #[serde(default, with = "humantime_serde")]
  pub memory_ttl: Option<Duration>,
  #[serde(default, with = "humantime_serde")]
  pub hard_max_age: Option<Duration>,
  pub max_entries: Option<usize>,
  pub cleanup_threshold: Option<usize>,
  #[serde(default, with = "humantime_serde")]
  pub stage_timeout: Option<Duration>,
  #[serde(default, with = "humantime_serde")]
  pub debounce: Option<Duration>,
  pub batch_size: Option<usize>,
  pub fallback_policy: Option<FallbackPolicy>,
}

impl CacheSettingsPatch {
  pub fn apply(&self, base: CacheSettings) -> CacheSettings {
    CacheSettings {
      ttl: self.ttl.unwrap_or(base.ttl),
      memory_ttl: self.memory_ttl.or(base.memory_ttl),
      hard_max_age: self.hard_max_age.unwrap_or(base.hard_max_age),
      max_entries: self.max_entries.unwrap_or(base.max_entries),
      cleanup_threshold: self.cleanup_threshold.unwrap_or(base.cleanup_threshold),
      stage_timeout: self.stage_timeout.unwrap_or(base.stage_timeout),
      debounce: self.debounce.unwrap_or(base.debounce),
      batch_size: self.batch_size.unwrap_or(base.batch_size),
      fallback_policy: self.fallback_policy.unwrap_or(base.fallback_policy),
    }
  }
}
