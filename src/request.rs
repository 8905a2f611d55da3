//! Request options as sent to the transport and stored offline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fully resolved request.
///
/// This is also the stored form of a request, so its serialization must be
/// canonical: headers live in a sorted map and absent fields are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
  pub method: String,
  pub url: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub headers: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  /// Log queueing and caching of this request at info level
  #[serde(default, skip_serializing_if = "is_false")]
  pub log_enabled: bool,
}

fn is_false(b: &bool) -> bool {
  !*b
}

impl RequestOptions {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
      log_enabled: false,
    }
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  /// Remove a header regardless of the case it was set with.
  pub fn remove_header(&mut self, name: &str) -> Option<String> {
    let key = self
      .headers
      .keys()
      .find(|k| k.eq_ignore_ascii_case(name))
      .cloned()?;
    self.headers.remove(&key)
  }
}

/// Per-call parameters merged onto a [`ServiceEndpoint`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInit {
  /// Defaults to GET
  #[serde(default)]
  pub method: Option<String>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub query: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<Value>,
}

impl RequestInit {
  pub fn method(mut self, method: impl Into<String>) -> Self {
    self.method = Some(method.into());
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.insert(name.into(), value.into());
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }
}

/// Base URL and defaults shared by every request a service makes.
#[derive(Debug, Clone, Default)]
pub struct ServiceEndpoint {
  pub base_url: String,
  pub headers: BTreeMap<String, String>,
  pub log_enabled: bool,
}

impl ServiceEndpoint {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into(),
      ..Self::default()
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_logging(mut self, enabled: bool) -> Self {
    self.log_enabled = enabled;
    self
  }

  /// Resolve `path` against the base URL and merge `init` onto the defaults.
  ///
  /// Per-call headers override defaults. Absolute URLs in `path` are used
  /// as-is.
  pub fn request_options(&self, path: &str, init: RequestInit) -> RequestOptions {
    let mut url = if path.contains("://") || self.base_url.is_empty() {
      path.to_string()
    } else {
      format!(
        "{}/{}",
        self.base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
      )
    };

    if !init.query.is_empty() {
      let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(init.query.iter())
        .finish();
      url.push(if url.contains('?') { '&' } else { '?' });
      url.push_str(&query);
    }

    let mut headers = self.headers.clone();
    headers.extend(init.headers);

    RequestOptions {
      method: init
        .method
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_else(|| "GET".to_string()),
      url,
      headers,
      body: init.body,
      log_enabled: self.log_enabled,
    }
  }
}
