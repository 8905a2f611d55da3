//! Mutual-exclusion gate for storage writers.

use std::future::Future;

use tokio::sync::Mutex;

/// Serializes logical writes against the store.
///
/// A single upsert is several statements (schema growth, delete, insert and
/// one update per fragment). Callers queue in arrival order and exactly one
/// closure runs at a time. Reads do not pass through the gate.
pub struct Gate {
  name: &'static str,
  lock: Mutex<()>,
}

impl Gate {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      lock: Mutex::new(()),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Wait for every earlier caller, then run `f` to completion.
  ///
  /// The result of `f` (including its error) is returned unchanged.
  pub async fn with_exclusive_access<F, Fut, T>(&self, f: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    let _guard = self.lock.lock().await;
    tracing::trace!(gate = self.name, "acquired");
    f().await
  }
}
