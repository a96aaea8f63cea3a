//! Cancelable delayed task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A task that runs once after a delay unless it is re-armed or cancelled first.
///
/// Re-arming restarts the delay. Only the waiting phase can be cancelled: once
/// the delay has elapsed the task is detached and always runs to completion.
#[derive(Debug, Default)]
pub struct DelayedTask {
  handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
  pub fn new() -> Self {
    Self::default()
  }

  /// Schedule `task` to run after `delay`, replacing any pending schedule.
  pub fn arm<F>(&mut self, delay: Duration, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.cancel();
    self.handle = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      tokio::spawn(task);
    }));
  }

  /// Cancel the pending schedule. Returns true if a task was still waiting.
  pub fn cancel(&mut self) -> bool {
    match self.handle.take() {
      Some(handle) if !handle.is_finished() => {
        handle.abort();
        true
      }
      _ => false,
    }
  }

  pub fn is_armed(&self) -> bool {
    self
      .handle
      .as_ref()
      .map(|h| !h.is_finished())
      .unwrap_or(false)
  }
}

impl Drop for DelayedTask {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_rearm_fires_once_after_quiet_period() {
    let fired = Arc::new(AtomicU32::new(0));
    let mut task = DelayedTask::new();

    for _ in 0..5 {
      let fired = fired.clone();
      task.arm(Duration::from_millis(1000), async move {
        fired.fetch_add(1, Ordering::SeqCst);
      });
      tokio::time::sleep(Duration::from_millis(400)).await;
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!task.is_armed());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_prevents_run() {
    let fired = Arc::new(AtomicU32::new(0));
    let mut task = DelayedTask::new();
    let f = fired.clone();
    task.arm(Duration::from_millis(100), async move {
      f.fetch_add(1, Ordering::SeqCst);
    });

    assert!(task.cancel());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
  }
}
