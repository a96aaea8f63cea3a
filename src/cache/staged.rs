//! Staged origin fetches: stage identifiers, the per-key progress state
//! machine, and the field-keyed merge of partial records.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{CacheError, Result};

/// One phase of a multi-phase origin fetch. Stages always run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
  /// Minimal fields for the primary numbers.
  Critical,
  /// The complete record needed for derived metrics.
  Full,
  /// Supplementary aggregates, not required for first paint.
  Enhancement,
}

impl Stage {
  pub const ALL: [Stage; 3] = [Stage::Critical, Stage::Full, Stage::Enhancement];

  pub fn as_str(self) -> &'static str {
    match self {
      Stage::Critical => "critical",
      Stage::Full => "full",
      Stage::Enhancement => "enhancement",
    }
  }
}

impl std::fmt::Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Progress of the staged fetch for one key.
///
/// ```text
/// Empty -> Stage1Pending -> Stage1Ready -> Stage2Pending -> Full
///                                                  -> Stage3Pending -> Enhanced
/// Empty | Stage1Pending -> Failed
/// ```
///
/// Once stage 1 has succeeded the key never returns to `Failed`: a later
/// stage failing leaves the last ready state in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
  #[default]
  Empty,
  Stage1Pending,
  Stage1Ready,
  Stage2Pending,
  Full,
  Stage3Pending,
  Enhanced,
  Failed,
}

impl StageState {
  /// Whether some stage result is available.
  pub fn has_data(self) -> bool {
    matches!(
      self,
      StageState::Stage1Ready
        | StageState::Stage2Pending
        | StageState::Full
        | StageState::Stage3Pending
        | StageState::Enhanced
    )
  }

  pub fn is_pending(self) -> bool {
    matches!(
      self,
      StageState::Stage1Pending | StageState::Stage2Pending | StageState::Stage3Pending
    )
  }

  /// State after `stage` starts. Returns `None` if the stage may not start here.
  pub fn begin(self, stage: Stage) -> Option<StageState> {
    use StageState::*;
    match (self, stage) {
      // A refresh may restart from any settled state.
      (Empty | Failed | Stage1Ready | Full | Enhanced, Stage::Critical) => Some(Stage1Pending),
      (Stage1Ready, Stage::Full) => Some(Stage2Pending),
      // Stage 2 may be skipped entirely.
      (Stage1Ready | Full, Stage::Enhancement) => Some(Stage3Pending),
      _ => None,
    }
  }

  /// State after `stage` succeeds.
  pub fn complete(self, stage: Stage) -> StageState {
    use StageState::*;
    match (self, stage) {
      (Stage1Pending, Stage::Critical) => Stage1Ready,
      (Stage2Pending, Stage::Full) => Full,
      (Stage3Pending, Stage::Enhancement) => Enhanced,
      (state, _) => state,
    }
  }

  /// State after `stage` fails. Earlier results stay visible.
  pub fn fail(self) -> StageState {
    use StageState::*;
    match self {
      Empty | Stage1Pending => Failed,
      Stage2Pending => Stage1Ready,
      Stage3Pending => Full,
      state => state,
    }
  }

  /// State once every declared stage has run.
  ///
  /// A record whose stage 2 was never declared is complete after stage 1.
  pub fn settle(self, stages: &[Stage]) -> StageState {
    match self {
      StageState::Stage1Ready if !stages.contains(&Stage::Full) => StageState::Full,
      state => state,
    }
  }
}

/// Merge a later stage's partial record over an earlier one.
///
/// Both values are viewed as JSON objects. Every non-null field of `later`
/// replaces the field of the same name in `earlier`; fields `later` does not
/// carry are kept. Non-object values are replaced wholesale.
pub fn merge_fields<V>(earlier: &V, later: &V) -> Result<V>
where
  V: Serialize + DeserializeOwned,
{
  let mut base = serde_json::to_value(earlier)?;
  let overlay = serde_json::to_value(later)?;

  match (&mut base, overlay) {
    (Value::Object(base_fields), Value::Object(later_fields)) => {
      for (name, value) in later_fields {
        if !value.is_null() {
          base_fields.insert(name, value);
        }
      }
    }
    (_, overlay) => base = overlay,
  }

  serde_json::from_value(base)
    .map_err(|e| CacheError::validation(format!("merged record has wrong shape: {}", e)))
}
