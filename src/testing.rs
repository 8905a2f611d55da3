//! Test doubles shared by the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::TransportError;
use crate::net::{Connectivity, Transport};
use crate::request::{RequestOptions, ServiceEndpoint};
use crate::service::ServiceContext;
use crate::store::{RecordStore, StoreOptions};

pub const BASE_URL: &str = "https://api.test";

/// Scripted [`Transport`] that records every call.
#[derive(Default)]
pub struct MockTransport {
  calls: Mutex<Vec<RequestOptions>>,
  responses: Mutex<HashMap<String, Value>>,
  failures: Mutex<HashMap<String, TransportError>>,
  next_failure: Mutex<Option<TransportError>>,
  delay: Mutex<Option<Duration>>,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
}

impl MockTransport {
  pub fn respond(&self, url: &str, response: Value) {
    self.responses.lock().unwrap().insert(url.to_string(), response);
  }

  /// Fail every call to `url` until [`MockTransport::clear_failures`].
  pub fn fail_url(&self, url: &str, error: TransportError) {
    self.failures.lock().unwrap().insert(url.to_string(), error);
  }

  /// Fail only the next call, whatever its url.
  pub fn fail_next(&self, error: TransportError) {
    *self.next_failure.lock().unwrap() = Some(error);
  }

  pub fn clear_failures(&self) {
    self.failures.lock().unwrap().clear();
    self.next_failure.lock().unwrap().take();
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<RequestOptions> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Most calls ever in flight at once.
  pub fn peak_concurrency(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn execute(&self, request: &RequestOptions) -> Result<Value, TransportError> {
    self.calls.lock().unwrap().push(request.clone());
    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(current, Ordering::SeqCst);

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if let Some(error) = self.next_failure.lock().unwrap().take() {
      return Err(error);
    }
    if let Some(error) = self.failures.lock().unwrap().get(&request.url) {
      return Err(error.clone());
    }
    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&request.url)
        .cloned()
        .unwrap_or_else(|| json!({})),
    )
  }
}

/// In-memory context pointed at [`BASE_URL`].
pub fn context(connectivity: Connectivity) -> (Arc<ServiceContext>, Arc<MockTransport>) {
  let transport = Arc::new(MockTransport::default());
  let store = Arc::new(RecordStore::open(&StoreOptions::default()).unwrap());
  let ctx = ServiceContext::with_store(
    store,
    Arc::clone(&transport) as Arc<dyn Transport>,
    connectivity,
    ServiceEndpoint::new(BASE_URL),
  );
  (ctx, transport)
}
