//! Chunked payload codec.
//!
//! A value is serialized to JSON, passed through a pluggable text transform and
//! split into fragments small enough to fit in a single SQLite cell together
//! with the statement that writes it.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CodecError;

/// SQLite's default maximum string / statement length.
pub const SQLITE_HARD_LIMIT: usize = 1_000_000;
/// Room left for the surrounding `UPDATE ... SET dataN = ? WHERE id = ?`.
pub const STATEMENT_SIZE_BUFFER: usize = 2_000;
/// Largest fragment the codec emits, in bytes.
pub const MAX_FRAGMENT_SIZE: usize = SQLITE_HARD_LIMIT - STATEMENT_SIZE_BUFFER;

/// Reversible text transform applied to the serialized payload.
///
/// The default is base64. Implementations may encrypt, as long as `decode`
/// exactly reverses `encode` and `encode` is deterministic: content lookup
/// compares freshly encoded fragments against stored ones.
pub trait PayloadTransform: Send + Sync {
  fn encode(&self, plain: &str) -> String;
  fn decode(&self, encoded: &str) -> Result<String, CodecError>;
}

/// UTF-8 text stored as standard base64.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Transform;

impl PayloadTransform for Base64Transform {
  fn encode(&self, plain: &str) -> String {
    BASE64.encode(plain.as_bytes())
  }

  fn decode(&self, encoded: &str) -> Result<String, CodecError> {
    let bytes = BASE64
      .decode(encoded)
      .map_err(|e| CodecError(format!("invalid base64 payload: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| CodecError(format!("payload is not UTF-8: {}", e)))
  }
}

/// Stores the JSON text as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl PayloadTransform for IdentityTransform {
  fn encode(&self, plain: &str) -> String {
    plain.to_string()
  }

  fn decode(&self, encoded: &str) -> Result<String, CodecError> {
    Ok(encoded.to_string())
  }
}

/// Built-in transforms selectable from configuration.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
  #[default]
  Base64,
  Identity,
}

impl TransformKind {
  pub fn build(self) -> Arc<dyn PayloadTransform> {
    match self {
      TransformKind::Base64 => Arc::new(Base64Transform),
      TransformKind::Identity => Arc::new(IdentityTransform),
    }
  }
}

/// Encodes values into ordered fragments and back.
#[derive(Clone)]
pub struct PayloadCodec {
  transform: Arc<dyn PayloadTransform>,
  fragment_size: usize,
}

impl Default for PayloadCodec {
  fn default() -> Self {
    Self::new(Arc::new(Base64Transform))
  }
}

impl PayloadCodec {
  pub fn new(transform: Arc<dyn PayloadTransform>) -> Self {
    Self {
      transform,
      fragment_size: MAX_FRAGMENT_SIZE,
    }
  }

  /// Override the fragment size. Values above [`MAX_FRAGMENT_SIZE`] are clamped.
  pub fn with_fragment_size(mut self, fragment_size: usize) -> Self {
    self.fragment_size = fragment_size.clamp(1, MAX_FRAGMENT_SIZE);
    self
  }

  pub fn fragment_size(&self) -> usize {
    self.fragment_size
  }

  /// Serialize, transform and split `value`.
  pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<String>, CodecError> {
    let json = serde_json::to_string(value)?;
    let encoded = self.transform.encode(&json);
    Ok(split_fragments(&encoded, self.fragment_size))
  }

  /// Join fragments in order, reverse the transform and parse.
  ///
  /// An empty fragment sequence decodes as JSON `null`.
  pub fn decode<T, I, S>(&self, fragments: I) -> Result<T, CodecError>
  where
    T: DeserializeOwned,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let joined: String = fragments.into_iter().fold(String::new(), |mut acc, f| {
      acc.push_str(f.as_ref());
      acc
    });
    let plain = self.transform.decode(&joined)?;
    if plain.is_empty() {
      return Ok(serde_json::from_str("null")?);
    }
    Ok(serde_json::from_str(&plain)?)
  }
}

/// Split `text` into pieces of at most `max` bytes without breaking a UTF-8
/// sequence. A single character wider than `max` becomes its own fragment.
fn split_fragments(text: &str, max: usize) -> Vec<String> {
  let mut fragments = Vec::with_capacity(text.len() / max + 1);
  let mut rest = text;

  while !rest.is_empty() {
    let mut end = max.min(rest.len());
    while !rest.is_char_boundary(end) {
      end -= 1;
    }
    if end == 0 {
      end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
    }
    let (head, tail) = rest.split_at(end);
    fragments.push(head.to_string());
    rest = tail;
  }

  fragments
}
