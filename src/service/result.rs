//! Result type returned by both engines.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A response together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResult {
  /// The response body; `None` only for queued requests
  pub data: Option<Value>,
  /// Where the data came from
  pub source: ResponseSource,
  /// When the served response was stored (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl ServiceResult {
  /// Create a new result from fresh network data.
  pub fn from_network(data: Value) -> Self {
    Self {
      data: Some(data),
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// Create a new result from cached data.
  pub fn from_cache(data: Value, cached_at: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// The request was accepted into the outbox but not sent yet.
  pub fn queued() -> Self {
    Self {
      data: None,
      source: ResponseSource::Queued,
      cached_at: None,
    }
  }

  pub fn is_queued(&self) -> bool {
    self.source == ResponseSource::Queued
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Stored response for an equal earlier request
  Cache,
  /// Nothing yet; the request waits in the outbox
  Queued,
}
