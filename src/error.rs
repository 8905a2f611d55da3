//! Error types shared by the storage layer and both request engines.

use std::fmt;

use thiserror::Error;

use crate::db::Table;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// Stored or freshly encoded payload could not be transformed or parsed.
  #[error(transparent)]
  Codec(#[from] CodecError),

  /// Content lookup matched more than one row.
  #[error("store corruption: {matches} rows in '{table}' share the same content")]
  StoreCorruption { table: Table, matches: usize },

  /// Offline with nothing cached for the request.
  #[error("no cached record found for request")]
  NoCachedRecord,

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("configuration: {0}")]
  Config(String),

  /// `close_store` already ran.
  #[error("the offline store has been closed")]
  StoreClosed,

  /// A user supplied hook rejected the request.
  #[error("request hook failed: {0}")]
  Hook(String),
}

impl Error {
  /// Whether replaying the same request later could succeed.
  pub fn is_permanent(&self) -> bool {
    match self {
      Error::Transport(e) => e.is_permanent(),
      Error::Codec(_) => true,
      _ => false,
    }
  }
}

#[derive(Debug, Error)]
#[error("codec: {0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
  fn from(e: serde_json::Error) -> Self {
    CodecError(format!("invalid JSON payload: {}", e))
  }
}

/// Failure reported by a [`Transport`](crate::net::Transport).
#[derive(Debug, Clone)]
pub struct TransportError {
  pub status: Option<u16>,
  pub message: String,
}

impl TransportError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      status: None,
      message: message.into(),
    }
  }

  pub fn with_status(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      message: message.into(),
    }
  }

  /// Client errors will fail the same way on every retry, except for
  /// request timeout and rate limiting.
  pub fn is_permanent(&self) -> bool {
    matches!(self.status, Some(s) if (400..500).contains(&s) && s != 408 && s != 429)
  }
}

impl fmt::Display for TransportError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.status {
      Some(status) => write!(f, "HTTP {}: {}", status, self.message),
      None => f.write_str(&self.message),
    }
  }
}

impl std::error::Error for TransportError {}
