//! Error taxonomy for the caching tiers.

use std::time::Duration;

use thiserror::Error;

/// A storage tier whose failures are logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
  Fallback,
  Durable,
}

impl Tier {
  pub fn as_str(self) -> &'static str {
    match self {
      Tier::Fallback => "fallback",
      Tier::Durable => "durable",
    }
  }
}

impl std::fmt::Display for Tier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Errors produced while resolving a cache key.
///
/// Only origin failures (including stage timeouts) ever reach a consumer, and
/// only when no tier holds a last-known value. The variant is `Clone` so one
/// origin outcome can be handed to every caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// A non-terminal tier threw or returned an error.
  #[error("{tier} tier unavailable: {message}")]
  TierUnavailable { tier: Tier, message: String },

  /// The ultimate data source failed.
  #[error("origin fetch failed: {0}")]
  OriginFailure(String),

  /// A stage of the origin fetch did not finish in time.
  #[error("stage {stage} timed out after {after:?}")]
  Timeout { stage: &'static str, after: Duration },

  /// A retrieved value failed a shape or safety check.
  #[error("validation failed: {0}")]
  ValidationFailure(String),
}

impl CacheError {
  pub fn tier(tier: Tier, message: impl std::fmt::Display) -> Self {
    Self::TierUnavailable {
      tier,
      message: message.to_string(),
    }
  }

  pub fn origin(message: impl std::fmt::Display) -> Self {
    Self::OriginFailure(message.to_string())
  }

  pub fn validation(message: impl std::fmt::Display) -> Self {
    Self::ValidationFailure(message.to_string())
  }

  /// Whether this error came from the origin (and may therefore propagate).
  pub fn is_origin_failure(&self) -> bool {
    matches!(self, Self::OriginFailure(_) | Self::Timeout { .. })
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(err: serde_json::Error) -> Self {
    Self::validation(err)
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
