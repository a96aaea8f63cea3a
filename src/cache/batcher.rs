//! Background write batcher for the durable tier.
//!
//! Writes are buffered per key (last write wins) and flushed once no new write
//! has arrived for a quiet period. A flush submits the buffered records in
//! fixed-size batches, one after another; a failed batch is logged and does
//! not stop the rest.
//!
//! Flushes never overlap. Records stay visible as unacknowledged from the
//! moment a flush takes them until their batch completes, so a shutdown that
//! cannot wait for a running flush still knows what to beacon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::durable::{DurableRecord, DurableStore};
use super::task::DelayedTask;

/// Debounce and batch sizing for a batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
  pub debounce: Duration,
  pub batch_size: usize,
}

impl Default for BatcherConfig {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(1),
      batch_size: 100,
    }
  }
}

/// A record waiting to be written.
#[derive(Debug, Clone)]
pub struct WriteQueueItem {
  pub key: String,
  pub record: DurableRecord,
  pub enqueued_at: DateTime<Utc>,
}

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub batches: usize,
  pub written: usize,
  pub failed: usize,
  /// Records handed to the beacon transport because the time budget ran out.
  pub beaconed: usize,
}

/// Debounced, coalescing writer in front of a [`DurableStore`].
#[derive(Clone)]
pub struct WriteBatcher {
  inner: Arc<BatcherInner>,
}

struct BatcherInner {
  name: String,
  store: Arc<dyn DurableStore>,
  config: BatcherConfig,
  pending: Mutex<HashMap<String, WriteQueueItem>>,
  unacked: Mutex<HashMap<String, DurableRecord>>,
  flush_lock: tokio::sync::Mutex<()>,
  timer: Mutex<DelayedTask>,
  written: AtomicU64,
  failed: AtomicU64,
}

impl WriteBatcher {
  pub fn new(name: impl Into<String>, store: Arc<dyn DurableStore>, config: BatcherConfig) -> Self {
    let config = BatcherConfig {
      batch_size: config.batch_size.max(1),
      ..config
    };
    Self {
      inner: Arc::new(BatcherInner {
        name: name.into(),
        store,
        config,
        pending: Mutex::new(HashMap::new()),
        unacked: Mutex::new(HashMap::new()),
        flush_lock: tokio::sync::Mutex::new(()),
        timer: Mutex::new(DelayedTask::new()),
        written: AtomicU64::new(0),
        failed: AtomicU64::new(0),
      }),
    }
  }

  /// Buffer `record` and restart the quiet period.
  pub fn enqueue(&self, record: DurableRecord, now: DateTime<Utc>) {
    let key = record.cache_key.clone();
    {
      let mut pending = relock(&self.inner.pending);
      pending.insert(
        key.clone(),
        WriteQueueItem {
          key: key.clone(),
          record,
          enqueued_at: now,
        },
      );
    }
    tracing::trace!(cache = %self.inner.name, key = %key, "Queued durable write");

    let weak: Weak<BatcherInner> = Arc::downgrade(&self.inner);
    let mut timer = relock(&self.inner.timer);
    timer.arm(self.inner.config.debounce, async move {
      if let Some(inner) = weak.upgrade() {
        WriteBatcher { inner }.flush().await;
      }
    });
  }

  /// Number of buffered records.
  pub fn pending_len(&self) -> usize {
    self.inner.pending.lock().map(|p| p.len()).unwrap_or(0)
  }

  /// Whether a record for `key` is buffered.
  pub fn is_pending(&self, key: &str) -> bool {
    self
      .inner
      .pending
      .lock()
      .map(|p| p.contains_key(key))
      .unwrap_or(false)
  }

  /// Snapshot of the buffered record for `key`.
  pub fn pending_record(&self, key: &str) -> Option<DurableRecord> {
    self
      .inner
      .pending
      .lock()
      .ok()
      .and_then(|p| p.get(key).map(|item| item.record.clone()))
  }

  /// Totals of records written and failed since creation.
  pub fn totals(&self) -> (u64, u64) {
    (
      self.inner.written.load(Ordering::Relaxed),
      self.inner.failed.load(Ordering::Relaxed),
    )
  }

  /// Number of records taken by a flush whose batch has not completed yet.
  pub fn unacked_len(&self) -> usize {
    relock(&self.inner.unacked).len()
  }

  /// Write everything buffered now, after any flush already running.
  pub async fn flush(&self) -> FlushReport {
    let _flushing = self.inner.flush_lock.lock().await;
    let items = self.inner.drain();
    self.inner.write(items, None).await
  }

  /// Flush on teardown within `budget`.
  ///
  /// The debounce timer is cancelled first and a flush already running is
  /// waited for. Records that cannot be submitted before the budget runs out,
  /// including those still held by that running flush, are handed to the
  /// store's beacon transport.
  pub async fn shutdown(&self, budget: Duration) -> FlushReport {
    relock(&self.inner.timer).cancel();
    let deadline = Instant::now() + budget;
    let report = match tokio::time::timeout_at(deadline, self.inner.flush_lock.lock()).await {
      Ok(_flushing) => {
        let items = self.inner.drain();
        self.inner.write(items, Some(deadline)).await
      }
      Err(_) => self.inner.abandon(),
    };
    info!(
      cache = %self.inner.name,
      written = report.written,
      failed = report.failed,
      beaconed = report.beaconed,
      "Flushed pending durable writes on shutdown",
    );
    report
  }
}

impl BatcherInner {
  /// Take all pending items, oldest first, marking them unacknowledged.
  fn drain(&self) -> Vec<WriteQueueItem> {
    let mut items: Vec<WriteQueueItem> = relock(&self.pending).drain().map(|(_, item)| item).collect();
    items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.key.cmp(&b.key)));
    relock(&self.unacked).extend(
      items
        .iter()
        .map(|item| (item.key.clone(), item.record.clone())),
    );
    items
  }

  fn acknowledge(&self, records: &[DurableRecord]) {
    let mut unacked = relock(&self.unacked);
    for record in records {
      unacked.remove(&record.cache_key);
    }
  }

  /// Beacon everything buffered or held by a flush that is still running.
  fn abandon(&self) -> FlushReport {
    let mut records: Vec<DurableRecord> = relock(&self.unacked).drain().map(|(_, r)| r).collect();
    records.extend(relock(&self.pending).drain().map(|(_, item)| item.record));
    let mut report = FlushReport::default();
    if records.is_empty() {
      return report;
    }
    warn!(
      cache = %self.name,
      records = records.len(),
      "Running flush did not finish in time, beaconing its records",
    );
    self.beacon(records, &mut report);
    report
  }

  fn beacon(&self, records: Vec<DurableRecord>, report: &mut FlushReport) {
    let count = records.len();
    if self.store.send_beacon(records) {
      report.beaconed += count;
    } else {
      report.failed += count;
      self.failed.fetch_add(count as u64, Ordering::Relaxed);
    }
  }

  async fn write(&self, items: Vec<WriteQueueItem>, deadline: Option<Instant>) -> FlushReport {
    let mut report = FlushReport::default();
    if items.is_empty() {
      return report;
    }

    let records: Vec<DurableRecord> = items.into_iter().map(|item| item.record).collect();
    let mut chunks = records.chunks(self.config.batch_size);

    while let Some(chunk) = chunks.next() {
      report.batches += 1;
      let upsert = self.store.upsert(chunk.to_vec());
      let result = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, upsert).await {
          Ok(result) => result,
          Err(_) => {
            // Out of time: this chunk and the rest go out fire-and-forget.
            let rest: Vec<DurableRecord> =
              chunk.iter().chain(chunks.by_ref().flatten()).cloned().collect();
            self.acknowledge(&rest);
            self.beacon(rest, &mut report);
            break;
          }
        },
        None => upsert.await,
      };
      self.acknowledge(chunk);

      match result {
        Ok(outcome) if outcome.is_ok() => {
          report.written += chunk.len();
          self.written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Ok(outcome) => {
          let failed = outcome.errors.len().min(chunk.len());
          report.written += chunk.len() - failed;
          report.failed += failed;
          self.written.fetch_add((chunk.len() - failed) as u64, Ordering::Relaxed);
          self.failed.fetch_add(failed as u64, Ordering::Relaxed);
          warn!(
            cache = %self.name,
            store = self.store.name(),
            errors = ?outcome.errors,
            "Durable store rejected part of a batch",
          );
        }
        Err(e) => {
          report.failed += chunk.len();
          self.failed.fetch_add(chunk.len() as u64, Ordering::Relaxed);
          warn!(
            cache = %self.name,
            store = self.store.name(),
            error = %e,
            records = chunk.len(),
            "Durable batch write failed",
          );
        }
      }
    }

    debug!(
      cache = %self.name,
      batches = report.batches,
      written = report.written,
      failed = report.failed,
      "Flushed durable writes",
    );
    report
  }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

impl Drop for BatcherInner {
  fn drop(&mut self) {
    // Last chance for anything still buffered; no async work can run here.
    let pending = match self.pending.get_mut() {
      Ok(pending) => pending,
      Err(poisoned) => poisoned.into_inner(),
    };
    if pending.is_empty() {
      return;
    }
    let records: Vec<DurableRecord> = pending.drain().map(|(_, item)| item.record).collect();
    let count = records.len();
    if !self.store.send_beacon(records) {
      warn!(cache = %self.name, records = count, "Dropped unflushed durable writes");
    }
  }
}
