//! Detached tasks whose outcome the caller never awaits.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::task::JoinSet;

use crate::error::Result;

/// Owns fire-and-forget work such as cache refreshes.
///
/// Failures are logged here and never reach the request that spawned the
/// task. [`BackgroundTasks::flush`] waits for everything spawned so far.
#[derive(Default)]
pub struct BackgroundTasks {
  tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn spawn<F>(&self, label: &'static str, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

    // Reap whatever already finished so the set does not grow unbounded
    while let Some(finished) = tasks.try_join_next() {
      log_join_error(finished);
    }

    tasks.spawn(async move {
      if let Err(e) = task.await {
        tracing::warn!(task = label, error = %e, "background task failed");
      }
    });
  }

  /// Number of tasks not yet reaped.
  pub fn len(&self) -> usize {
    self
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Wait until every spawned task, including ones spawned while waiting,
  /// has finished.
  pub async fn flush(&self) {
    loop {
      let mut batch = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
      if batch.is_empty() {
        return;
      }
      while let Some(finished) = batch.join_next().await {
        log_join_error(finished);
      }
    }
  }
}

fn log_join_error(result: std::result::Result<(), tokio::task::JoinError>) {
  if let Err(e) = result {
    tracing::error!(error = %e, "background task panicked or was cancelled");
  }
}
