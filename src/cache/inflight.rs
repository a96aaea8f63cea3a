//! Per-key deduplication of origin fetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, Shared};

use super::traits::CacheEntry;
use crate::error::Result;

/// A fetch that any number of callers can await.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<CacheEntry<V>>>>;

/// Result of [`InFlightGuard::claim`].
pub enum Claim<V: Clone> {
  /// A fetch for the key was already running; await it.
  Joined(SharedFetch<V>),
  /// This call started the fetch.
  Started(SharedFetch<V>),
}

impl<V: Clone> Claim<V> {
  pub fn into_future(self) -> SharedFetch<V> {
    match self {
      Claim::Joined(fetch) | Claim::Started(fetch) => fetch,
    }
  }

  pub fn is_started(&self) -> bool {
    matches!(self, Claim::Started(_))
  }
}

struct Flight<V: Clone> {
  id: u64,
  fetch: SharedFetch<V>,
}

/// Map of cache key to the fetch currently running for it.
///
/// Check and insert happen under a single lock acquisition, so at most one
/// fetch per key is ever started. The lock is never held across an await.
pub struct InFlightGuard<V: Clone> {
  flights: Mutex<HashMap<String, Flight<V>>>,
  next_id: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> InFlightGuard<V> {
  pub fn new() -> Self {
    Self {
      flights: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
    }
  }

  /// Join the fetch running for `key`, or start one with `start`.
  ///
  /// `start` receives the flight id to pass to [`release`](Self::release)
  /// once the work behind the fetch is finished.
  pub fn claim<S>(&self, key: &str, start: S) -> Claim<V>
  where
    S: FnOnce(u64) -> BoxFuture<'static, Result<CacheEntry<V>>>,
  {
    let mut flights = match self.flights.lock() {
      Ok(flights) => flights,
      Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(flight) = flights.get(key) {
      tracing::trace!(key = %key, "Joining in-flight fetch");
      return Claim::Joined(flight.fetch.clone());
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let fetch = start(id).shared();
    flights.insert(
      key.to_string(),
      Flight {
        id,
        fetch: fetch.clone(),
      },
    );
    tracing::trace!(key = %key, flight = id, "Started origin fetch");
    Claim::Started(fetch)
  }

  /// Clear the guard for `key` if it still belongs to flight `id`.
  pub fn release(&self, key: &str, id: u64) -> bool {
    let mut flights = match self.flights.lock() {
      Ok(flights) => flights,
      Err(poisoned) => poisoned.into_inner(),
    };
    match flights.get(key) {
      Some(flight) if flight.id == id => {
        flights.remove(key);
        tracing::trace!(key = %key, flight = id, "Released in-flight guard");
        true
      }
      _ => false,
    }
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self
      .flights
      .lock()
      .map(|f| f.contains_key(key))
      .unwrap_or(false)
  }

  pub fn len(&self) -> usize {
    self.flights.lock().map(|f| f.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<V: Clone + Send + Sync + 'static> Default for InFlightGuard<V> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::EntrySource;
  use chrono::DateTime;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;
  use std::time::Duration;

  fn entry(value: u32) -> CacheEntry<u32> {
    CacheEntry::new(
      "k",
      value,
      DateTime::from_timestamp(0, 0).unwrap(),
      Duration::from_secs(60),
      EntrySource::Origin,
    )
  }

  #[tokio::test]
  async fn test_second_claim_joins_first() {
    let guard: InFlightGuard<u32> = InFlightGuard::new();
    let starts = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

    let s = starts.clone();
    let first = guard.claim("k", move |_| {
      s.fetch_add(1, Ordering::SeqCst);
      async move {
        let value = rx.await.unwrap();
        Ok(entry(value))
      }
      .boxed()
    });
    let s = starts.clone();
    let second = guard.claim("k", move |_| {
      s.fetch_add(1, Ordering::SeqCst);
      async { Ok(entry(0)) }.boxed()
    });

    assert!(first.is_started());
    assert!(!second.is_started());
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    tx.send(7).unwrap();
    let (a, b) = tokio::join!(first.into_future(), second.into_future());
    assert_eq!(*a.unwrap().value(), 7);
    assert_eq!(*b.unwrap().value(), 7);
  }

  #[tokio::test]
  async fn test_release_only_matching_flight() {
    let guard: InFlightGuard<u32> = InFlightGuard::new();
    let mut flight_id = 0;
    let _ = guard.claim("k", |id| {
      flight_id = id;
      async { Ok(entry(1)) }.boxed()
    });
    assert!(guard.is_in_flight("k"));

    assert!(!guard.release("k", flight_id + 100));
    assert!(guard.is_in_flight("k"));
    assert!(guard.release("k", flight_id));
    assert!(guard.is_empty());
  }
}
