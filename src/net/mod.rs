//! Network collaborators: request execution and connectivity state.

mod connectivity;
mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::RequestOptions;

pub use connectivity::{Connectivity, ConnectivityProbe, NetworkState};
pub use http::HttpTransport;

/// Executes a request against the remote API.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn execute(&self, request: &RequestOptions) -> Result<Value, TransportError>;
}
