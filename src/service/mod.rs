//! Request engines: the outbox ([`OfflineRequestService`]) and the response
//! cache ([`OfflineResponseService`]).
//!
//! Both are built from one shared [`ServiceContext`], which owns the record
//! store and the network collaborators.

mod background;
mod cache;
mod outbox;
mod result;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::net::{Connectivity, Transport};
use crate::request::{RequestInit, ServiceEndpoint};
use crate::store::{RecordStore, StoreOptions};

pub use background::BackgroundTasks;
pub use cache::{OfflineResponseService, RequestCleaner, ServeFrom};
pub use outbox::{OfflineRequestService, ReplaySummary, RequestRewriter};
pub use result::{ResponseSource, ServiceResult};

/// Anything that can answer a request for `path`.
#[async_trait]
pub trait Requestable: Send + Sync {
  async fn request(&self, path: &str, init: RequestInit) -> Result<ServiceResult>;
}

/// Configuration and shared handles, created once per process.
pub struct ServiceContext {
  store: Arc<RecordStore>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  endpoint: ServiceEndpoint,
}

impl ServiceContext {
  /// Open the store described by `options` and bundle it with the network
  /// collaborators.
  pub fn configure(
    options: &StoreOptions,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    endpoint: ServiceEndpoint,
  ) -> Result<Arc<Self>> {
    let store = Arc::new(RecordStore::open(options)?);
    Ok(Self::with_store(store, transport, connectivity, endpoint))
  }

  pub fn with_store(
    store: Arc<RecordStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    endpoint: ServiceEndpoint,
  ) -> Arc<Self> {
    Arc::new(Self {
      store,
      transport,
      connectivity,
      endpoint,
    })
  }

  pub fn store(&self) -> &Arc<RecordStore> {
    &self.store
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn endpoint(&self) -> &ServiceEndpoint {
    &self.endpoint
  }

  pub fn is_offline(&self) -> bool {
    self.connectivity.is_offline()
  }

  /// Drop the cache and the outbox. Irreversible.
  pub async fn drop_all_tables(&self) -> Result<()> {
    self.store.drop_all_tables().await
  }

  /// Close the store. Must be the last storage operation of the process.
  pub async fn close_store(&self) -> Result<()> {
    self.store.close().await
  }
}
