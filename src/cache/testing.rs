//! Test doubles shared by the cache tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use super::durable::{DurableRecord, DurableStore, KeyFilter, UpsertOutcome};
use super::staged::Stage;
use super::traits::{CacheKey, Cacheable, Clock, OriginFetcher};
use crate::error::{CacheError, Result, Tier};

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      now: Mutex::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap();
    *now += chrono::Duration::from_std(by).unwrap();
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

/// In-memory durable store that records every call.
#[derive(Default)]
pub struct RecordingStore {
  pub rows: Mutex<HashMap<String, DurableRecord>>,
  pub upserts: Mutex<Vec<Vec<DurableRecord>>>,
  pub beacons: Mutex<Vec<Vec<DurableRecord>>>,
  pub queries: Mutex<Vec<KeyFilter>>,
  pub fail_queries: AtomicBool,
  pub fail_upserts: AtomicBool,
  pub upsert_delay: Mutex<Option<Duration>>,
  upsert_calls: AtomicUsize,
}

impl RecordingStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, record: DurableRecord) {
    self
      .rows
      .lock()
      .unwrap()
      .insert(record.cache_key.clone(), record);
  }

  pub fn upsert_calls(&self) -> usize {
    self.upsert_calls.load(Ordering::SeqCst)
  }

  pub fn query_calls(&self) -> usize {
    self.queries.lock().unwrap().len()
  }

  pub fn upserted_keys(&self) -> Vec<String> {
    self
      .upserts
      .lock()
      .unwrap()
      .iter()
      .flatten()
      .map(|r| r.cache_key.clone())
      .collect()
  }
}

impl DurableStore for RecordingStore {
  fn name(&self) -> &'static str {
    "recording"
  }

  fn query(&self, filter: KeyFilter) -> BoxFuture<'_, Result<Vec<DurableRecord>>> {
    Box::pin(async move {
      self.queries.lock().unwrap().push(filter.clone());
      if self.fail_queries.load(Ordering::SeqCst) {
        return Err(CacheError::tier(Tier::Durable, "connection refused"));
      }
      let rows = self.rows.lock().unwrap();
      Ok(
        filter
          .keys()
          .into_iter()
          .filter_map(|k| rows.get(k).cloned())
          .collect(),
      )
    })
  }

  fn upsert(&self, records: Vec<DurableRecord>) -> BoxFuture<'_, Result<UpsertOutcome>> {
    Box::pin(async move {
      self.upsert_calls.fetch_add(1, Ordering::SeqCst);
      let delay = *self.upsert_delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      self.upserts.lock().unwrap().push(records.clone());
      if self.fail_upserts.load(Ordering::SeqCst) {
        return Err(CacheError::tier(Tier::Durable, "503 Service Unavailable"));
      }
      for record in records {
        self.insert(record);
      }
      Ok(UpsertOutcome::default())
    })
  }

  fn send_beacon(&self, records: Vec<DurableRecord>) -> bool {
    self.beacons.lock().unwrap().push(records);
    true
  }
}

/// Plain string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestKey(pub String);

impl TestKey {
  pub fn new(key: &str) -> Self {
    Self(key.to_string())
  }
}

impl CacheKey for TestKey {
  fn cache_key(&self) -> String {
    self.0.clone()
  }
}

/// Record whose fields are filled by different stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Probe {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub count: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ratio: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
}

impl Probe {
  pub fn count(count: u32) -> Self {
    Self {
      count: Some(count),
      ..Self::default()
    }
  }
}

impl Cacheable for Probe {
  fn entity_type() -> &'static str {
    "probe"
  }
}

/// Origin whose stages can be scripted with a delay and an outcome.
///
/// An unscripted critical stage returns `Probe::count(n)` where `n` is the
/// number of critical calls so far. Labels equal to `"bad"` fail validation
/// and are replaced by the `"placeholder"` label.
pub struct ScriptedFetcher {
  stages: Vec<Stage>,
  script: Mutex<HashMap<Stage, (Duration, Result<Probe>)>>,
  calls: Mutex<Vec<Stage>>,
}

impl ScriptedFetcher {
  pub fn new(stages: &[Stage]) -> Self {
    Self {
      stages: stages.to_vec(),
      script: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn single() -> Self {
    Self::new(&[Stage::Critical])
  }

  pub fn script(&self, stage: Stage, delay: Duration, outcome: Result<Probe>) {
    self.script.lock().unwrap().insert(stage, (delay, outcome));
  }

  pub fn calls(&self, stage: Stage) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|s| **s == stage)
      .count()
  }
}

impl OriginFetcher<TestKey> for ScriptedFetcher {
  type Value = Probe;

  fn stages(&self) -> &[Stage] {
    &self.stages
  }

  fn fetch_stage<'a>(
    &'a self,
    _key: &'a TestKey,
    stage: Stage,
    _prior: Option<&'a Probe>,
  ) -> BoxFuture<'a, Result<Probe>> {
    let critical_calls = {
      let mut calls = self.calls.lock().unwrap();
      calls.push(stage);
      calls.iter().filter(|s| **s == Stage::Critical).count() as u32
    };
    let scripted = self.script.lock().unwrap().get(&stage).cloned();
    async move {
      match scripted {
        Some((delay, outcome)) => {
          if !delay.is_zero() {
            tokio::time::sleep(delay).await;
          }
          outcome
        }
        None if stage == Stage::Critical => Ok(Probe::count(critical_calls)),
        None => Ok(Probe::default()),
      }
    }
    .boxed()
  }

  fn validate(&self, _key: &TestKey, value: Probe) -> Result<Probe> {
    if value.label.as_deref() == Some("bad") {
      return Err(CacheError::validation("label rejected"));
    }
    Ok(value)
  }

  fn default_value(&self, _key: &TestKey) -> Option<Probe> {
    Some(Probe {
      label: Some("placeholder".to_string()),
      ..Probe::default()
    })
  }
}
