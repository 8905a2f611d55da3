//! Offline support for calls to a remote JSON API.
//!
//! Two engines share one SQLite-backed [`store::RecordStore`]:
//!
//! - [`service::OfflineRequestService`] queues requests made while offline in
//!   an outbox and replays them once the network returns.
//! - [`service::OfflineResponseService`] caches the latest response for each
//!   distinct request and serves it when the network is unavailable.
//!
//! ```no_run
//! # async fn demo() -> offline_call::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use offline_call::net::{Connectivity, HttpTransport};
//! use offline_call::request::{RequestInit, ServiceEndpoint};
//! use offline_call::service::{OfflineRequestService, Requestable, ServiceContext};
//! use offline_call::store::StoreOptions;
//!
//! let ctx = ServiceContext::configure(
//!   &StoreOptions::at("service-call.sqlite"),
//!   Arc::new(HttpTransport::new(Duration::from_secs(30))?),
//!   Connectivity::default(),
//!   ServiceEndpoint::new("https://api.example.com"),
//! )?;
//! let outbox = Arc::new(OfflineRequestService::new(ctx));
//! outbox.start().await?;
//! outbox.request("/items", RequestInit::default().method("POST")).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod db;
pub mod error;
pub mod ids;
pub mod net;
pub mod request;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
