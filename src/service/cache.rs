//! Response cache: remember the last response for each distinct request and
//! serve it when the network is down, or first when configured to.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BackgroundTasks, Requestable, ServiceContext, ServiceResult};
use crate::error::{Error, Result};
use crate::request::{RequestInit, RequestOptions};
use crate::store::{Record, Table};

/// Which side answers first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeFrom {
  /// Network first; the cache is only read while offline
  #[default]
  Api,
  /// Cache first, refreshed in the background
  Db,
}

/// Normalizes a request before it is used as a cache key, e.g. by dropping
/// headers that change between sessions.
pub type RequestCleaner = Arc<dyn Fn(RequestOptions) -> RequestOptions + Send + Sync>;

pub struct OfflineResponseService {
  ctx: Arc<ServiceContext>,
  serve_from: ServeFrom,
  cleaner: Option<RequestCleaner>,
  background: BackgroundTasks,
}

impl OfflineResponseService {
  pub fn new(ctx: Arc<ServiceContext>) -> Self {
    Self {
      ctx,
      serve_from: ServeFrom::default(),
      cleaner: None,
      background: BackgroundTasks::new(),
    }
  }

  pub fn serve_from(mut self, serve_from: ServeFrom) -> Self {
    self.serve_from = serve_from;
    self
  }

  pub fn with_request_cleaner<F>(mut self, cleaner: F) -> Self
  where
    F: Fn(RequestOptions) -> RequestOptions + Send + Sync + 'static,
  {
    self.cleaner = Some(Arc::new(cleaner));
    self
  }

  pub fn context(&self) -> &Arc<ServiceContext> {
    &self.ctx
  }

  /// Answer `options` from the network or the cache.
  ///
  /// Cache writes and refreshes happen in the background and never fail the
  /// call; use [`OfflineResponseService::flush`] to wait for them.
  pub async fn send_request(&self, options: RequestOptions) -> Result<ServiceResult> {
    let key = self.cache_key(&options);

    match self.serve_from {
      ServeFrom::Db => {
        match self.lookup(&key).await {
          Ok(Some(cached)) => {
            if options.log_enabled {
              tracing::info!(url = %options.url, "serving cached response");
            }
            // Refresh only when the network can answer
            if !self.ctx.is_offline() {
              self.spawn_refresh(options, key);
            }
            return Ok(cached);
          }
          Ok(None) => {}
          Err(e) => tracing::warn!(url = %options.url, error = %e, "cache read failed"),
        }
        self.fetch_live(options, key).await
      }
      ServeFrom::Api if self.ctx.is_offline() => match self.lookup(&key).await? {
        Some(cached) => {
          if options.log_enabled {
            tracing::info!(url = %options.url, "offline, serving cached response");
          }
          Ok(cached)
        }
        None => {
          tracing::debug!(url = %options.url, "offline with no cached response");
          Err(Error::NoCachedRecord)
        }
      },
      ServeFrom::Api => self.fetch_live(options, key).await,
    }
  }

  /// Wait for every pending cache write and refresh.
  pub async fn flush(&self) {
    self.background.flush().await;
  }

  fn cache_key(&self, options: &RequestOptions) -> RequestOptions {
    match &self.cleaner {
      Some(clean) => clean(options.clone()),
      None => options.clone(),
    }
  }

  /// Stored response for a request equal to `key`, if any.
  async fn lookup(&self, key: &RequestOptions) -> Result<Option<ServiceResult>> {
    let store = self.ctx.store();
    let Some(request) = store.find::<IgnoredAny, _>(Table::Requests, key).await? else {
      return Ok(None);
    };
    let response: Option<Record<Value>> = store.get_by_id(Table::Responses, &request.id).await?;
    Ok(response.map(|record| ServiceResult::from_cache(record.data, record.timestamp)))
  }

  async fn fetch_live(&self, options: RequestOptions, key: RequestOptions) -> Result<ServiceResult> {
    let response = self.ctx.transport().execute(&options).await?;

    let ctx = Arc::clone(&self.ctx);
    let data = response.clone();
    let log_enabled = options.log_enabled;
    self.background.spawn("cache-response", async move {
      store_response(&ctx, &key, &data, log_enabled).await
    });

    Ok(ServiceResult::from_network(response))
  }

  fn spawn_refresh(&self, options: RequestOptions, key: RequestOptions) {
    let ctx = Arc::clone(&self.ctx);
    self.background.spawn("refresh-response", async move {
      let response = ctx.transport().execute(&options).await?;
      store_response(&ctx, &key, &response, options.log_enabled).await
    });
  }
}

/// Save `response` as the latest answer to `key`.
async fn store_response(
  ctx: &ServiceContext,
  key: &RequestOptions,
  response: &Value,
  log_enabled: bool,
) -> Result<()> {
  let store = ctx.store();
  let id = store.put_unique(Table::Requests, key).await?;
  store.put(Table::Responses, response, Some(&id)).await?;

  if log_enabled {
    tracing::info!(id = %id, url = %key.url, "response cached");
  } else {
    tracing::trace!(id = %id, "response cached");
  }
  Ok(())
}

#[async_trait]
impl Requestable for OfflineResponseService {
  async fn request(&self, path: &str, init: RequestInit) -> Result<ServiceResult> {
    let options = self.ctx.endpoint().request_options(path, init);
    self.send_request(options).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TransportError;
  use crate::net::{Connectivity, NetworkState};
  use crate::service::ResponseSource;
  use crate::testing::{context, MockTransport};
  use serde_json::json;

  fn cache(
    connectivity: &Connectivity,
    serve_from: ServeFrom,
  ) -> (OfflineResponseService, Arc<MockTransport>) {
    let (ctx, transport) = context(connectivity.clone());
    (OfflineResponseService::new(ctx).serve_from(serve_from), transport)
  }

  /// Store a request/response pair directly, bypassing the network.
  async fn seed(service: &OfflineResponseService, path: &str, response: Value) {
    let options = service
      .context()
      .endpoint()
      .request_options(path, RequestInit::default());
    let key = service.cache_key(&options);
    store_response(service.context(), &key, &response, false)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_db_mode_offline_serves_cache_without_transport() {
    let connectivity = Connectivity::new(NetworkState::Offline);
    let (service, transport) = cache(&connectivity, ServeFrom::Db);
    seed(&service, "/x", json!({"ok": true})).await;

    let result = service.request("/x", RequestInit::default()).await.unwrap();
    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.data, Some(json!({"ok": true})));
    assert!(result.cached_at.is_some());

    service.flush().await;
    assert_eq!(transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_db_mode_failed_refresh_keeps_cached_answer() {
    let connectivity = Connectivity::default();
    let (service, transport) = cache(&connectivity, ServeFrom::Db);
    transport.fail_next(TransportError::new("connection refused"));
    seed(&service, "/x", json!({"ok": true})).await;

    let first = service.request("/x", RequestInit::default()).await.unwrap();
    assert_eq!(first.data, Some(json!({"ok": true})));
    service.flush().await;
    assert_eq!(transport.call_count(), 1);

    connectivity.set_online(false);
    let again = service.request("/x", RequestInit::default()).await.unwrap();
    assert_eq!(again.data, Some(json!({"ok": true})));
  }

  #[tokio::test]
  async fn test_db_mode_refreshes_in_background() {
    let connectivity = Connectivity::default();
    let (service, transport) = cache(&connectivity, ServeFrom::Db);
    seed(&service, "/x", json!({"v": 1})).await;
    transport.respond("https://api.test/x", json!({"v": 2}));

    let first = service.request("/x", RequestInit::default()).await.unwrap();
    assert_eq!(first.data, Some(json!({"v": 1})));

    service.flush().await;
    assert_eq!(transport.call_count(), 1);
    let second = service.request("/x", RequestInit::default()).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.data, Some(json!({"v": 2})));
  }

  #[tokio::test]
  async fn test_db_mode_miss_goes_to_network() {
    let connectivity = Connectivity::default();
    let (service, transport) = cache(&connectivity, ServeFrom::Db);
    transport.respond("https://api.test/y", json!([1, 2]));

    let result = service.request("/y", RequestInit::default()).await.unwrap();
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.data, Some(json!([1, 2])));
  }

  #[tokio::test]
  async fn test_offline_miss_is_no_cached_record() {
    let connectivity = Connectivity::new(NetworkState::Offline);
    let (service, transport) = cache(&connectivity, ServeFrom::Api);

    let result = service.request("/missing", RequestInit::default()).await;
    assert!(matches!(result, Err(Error::NoCachedRecord)));
    assert_eq!(transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_online_response_is_served_offline_later() {
    let connectivity = Connectivity::default();
    let (service, transport) = cache(&connectivity, ServeFrom::Api);
    transport.respond("https://api.test/items", json!({"items": [1]}));

    let live = service.request("/items", RequestInit::default()).await.unwrap();
    assert_eq!(live.source, ResponseSource::Network);
    service.flush().await;

    connectivity.set_online(false);
    let cached = service.request("/items", RequestInit::default()).await.unwrap();
    assert_eq!(cached.source, ResponseSource::Cache);
    assert_eq!(cached.data, Some(json!({"items": [1]})));
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_repeated_requests_share_one_row() {
    let connectivity = Connectivity::default();
    let (service, transport) = cache(&connectivity, ServeFrom::Api);
    transport.respond("https://api.test/items", json!(1));

    for _ in 0..3 {
      service.request("/items", RequestInit::default()).await.unwrap();
    }
    service.flush().await;

    let store = service.context().store();
    assert_eq!(store.count(Table::Requests).unwrap(), 1);
    assert_eq!(store.count(Table::Responses).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cleaner_makes_auth_irrelevant_to_lookup() {
    let connectivity = Connectivity::default();
    let (ctx, transport) = context(connectivity.clone());
    let service = OfflineResponseService::new(ctx).with_request_cleaner(|mut options| {
      options.remove_header("Authorization");
      options
    });
    transport.respond("https://api.test/me", json!({"name": "n"}));

    let init = RequestInit::default().header("Authorization", "Bearer old");
    service.request("/me", init).await.unwrap();
    service.flush().await;
    // The live call still carried the header
    assert_eq!(transport.calls()[0].headers["Authorization"], "Bearer old");

    connectivity.set_online(false);
    let init = RequestInit::default().header("Authorization", "Bearer new");
    let cached = service.request("/me", init).await.unwrap();
    assert_eq!(cached.data, Some(json!({"name": "n"})));
  }

  #[tokio::test]
  async fn test_online_transport_error_is_returned() {
    let connectivity = Connectivity::default();
    let (service, transport) = cache(&connectivity, ServeFrom::Api);
    transport.fail_next(TransportError::with_status(500, "boom"));

    let result = service.request("/x", RequestInit::default()).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    service.flush().await;
    assert_eq!(service.context().store().count(Table::Responses).unwrap(), 0);
  }
}
