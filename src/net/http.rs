//! `reqwest` implementation of [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::Value;

use super::Transport;
use crate::error::TransportError;
use crate::request::RequestOptions;

/// Sends requests over HTTP(S) and parses JSON responses.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::new(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn execute(&self, request: &RequestOptions) -> Result<Value, TransportError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|_| TransportError::new(format!("invalid HTTP method '{}'", request.method)))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      let bytes = serde_json::to_vec(body)
        .map_err(|e| TransportError::new(format!("failed to serialize body: {}", e)))?;
      let has_content_type = request
        .headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
      if !has_content_type {
        builder = builder.header(CONTENT_TYPE, "application/json");
      }
      builder = builder.body(bytes);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError::new(format!("{} {} failed: {}", request.method, request.url, e)))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| TransportError::new(format!("failed to read response body: {}", e)))?;

    if !status.is_success() {
      let message = if text.trim().is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
      } else {
        text
      };
      return Err(TransportError::with_status(status.as_u16(), message));
    }

    Ok(parse_body(&text))
  }
}

/// JSON bodies are parsed, anything else is kept as a string, and an empty
/// body is `null`.
fn parse_body(text: &str) -> Value {
  if text.trim().is_empty() {
    return Value::Null;
  }
  serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
