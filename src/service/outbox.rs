//! Outbox engine: queue requests made offline and replay them later.
//!
//! Row lifecycle: `UNCLAIMED -> CLAIMED -> DELETED` on success, back to
//! `UNCLAIMED` on a retriable failure, or `FAILED` on a permanent one.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::task::JoinHandle;

use super::{Requestable, ServiceContext, ServiceResult};
use crate::error::{Error, Result};
use crate::net::NetworkState;
use crate::request::{RequestInit, RequestOptions};
use crate::store::{PendingEntry, Record, Table};

/// Hook applied to a copy of each queued request right before it is replayed,
/// e.g. to attach a fresh auth header.
pub type RequestRewriter =
  Arc<dyn Fn(RequestOptions) -> BoxFuture<'static, Result<RequestOptions>> + Send + Sync>;

/// Outcome counts of one [`OfflineRequestService::send_all`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
  /// Delivered and removed from the outbox
  pub sent: usize,
  /// Claim released after a retriable failure
  pub released: usize,
  /// Parked after a permanent failure
  pub failed: usize,
}

enum Delivery {
  Sent,
  Released,
  Failed,
}

/// Sends requests immediately when online and queues them when offline.
pub struct OfflineRequestService {
  ctx: Arc<ServiceContext>,
  rewriter: Option<RequestRewriter>,
}

impl OfflineRequestService {
  pub fn new(ctx: Arc<ServiceContext>) -> Self {
    Self {
      ctx,
      rewriter: None,
    }
  }

  pub fn with_request_rewriter<F, Fut>(mut self, rewriter: F) -> Self
  where
    F: Fn(RequestOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RequestOptions>> + Send + 'static,
  {
    let rewriter: RequestRewriter = Arc::new(move |options| rewriter(options).boxed());
    self.rewriter = Some(rewriter);
    self
  }

  pub fn context(&self) -> &Arc<ServiceContext> {
    &self.ctx
  }

  /// Send `options` now, or persist it in the outbox when offline.
  ///
  /// A queued request resolves with [`ServiceResult::queued`] once it is
  /// durably stored.
  pub async fn send_request(&self, options: RequestOptions) -> Result<ServiceResult> {
    if self.ctx.is_offline() {
      let id = self.ctx.store().put(Table::Pending, &options, None).await?;
      if options.log_enabled {
        tracing::info!(id = %id, method = %options.method, url = %options.url, "request added as pending");
      } else {
        tracing::debug!(id = %id, url = %options.url, "request added as pending");
      }
      return Ok(ServiceResult::queued());
    }

    let response = self.ctx.transport().execute(&options).await?;
    Ok(ServiceResult::from_network(response))
  }

  /// Replay every unclaimed outbox row while the network stays up.
  ///
  /// Rows are claimed one by one, then all claimed sends run concurrently.
  /// Individual send failures are absorbed into the summary. A storage error
  /// stops further claiming; rows already claimed are still sent before the
  /// error is returned.
  pub async fn send_all(&self) -> Result<ReplaySummary> {
    let store = self.ctx.store();
    let mut ids = store.unclaimed_ids().await?;
    let mut summary = ReplaySummary::default();
    let mut sends = Vec::with_capacity(ids.len());
    let mut halted = None;

    ids.reverse();
    while !self.ctx.is_offline() {
      let Some(id) = ids.pop() else {
        break;
      };

      let record: Record<RequestOptions> = match store.get_by_id(Table::Pending, &id).await {
        Ok(Some(record)) => record,
        // Delivered or dropped since the id list was read
        Ok(None) => continue,
        Err(e) if e.is_permanent() => {
          tracing::error!(id = %id, error = %e, "undecodable outbox row");
          match store.mark_failed(&id, None, &e.to_string()).await {
            Ok(true) => summary.failed += 1,
            Ok(false) => tracing::debug!(id = %id, "outbox row claimed elsewhere, not parked"),
            Err(e) => tracing::warn!(id = %id, error = %e, "failed to park outbox row"),
          }
          continue;
        }
        Err(e) => {
          halted = Some(e);
          break;
        }
      };

      let job_id = store.ids().new_id();
      match store.claim(&id, &job_id).await {
        Ok(true) => {}
        Ok(false) => {
          tracing::debug!(id = %id, "outbox row already claimed");
          continue;
        }
        Err(e) => {
          halted = Some(e);
          break;
        }
      }
      tracing::debug!(id = %id, job_id = %job_id, "claimed outbox row");

      sends.push(self.deliver(id, job_id, record.data));
    }

    for delivery in join_all(sends).await {
      match delivery {
        Delivery::Sent => summary.sent += 1,
        Delivery::Released => summary.released += 1,
        Delivery::Failed => summary.failed += 1,
      }
    }

    if summary != ReplaySummary::default() {
      tracing::info!(
        sent = summary.sent,
        released = summary.released,
        failed = summary.failed,
        "outbox replay finished"
      );
    }
    match halted {
      Some(e) => Err(e),
      None => Ok(summary),
    }
  }

  /// Send one claimed row and settle its claim.
  async fn deliver(&self, id: String, job_id: String, options: RequestOptions) -> Delivery {
    let store = self.ctx.store();

    let result = match &self.rewriter {
      Some(rewrite) => match rewrite(options.clone()).await {
        Ok(rewritten) => self.execute(&rewritten).await,
        Err(e) => Err(e),
      },
      None => self.execute(&options).await,
    };

    match result {
      Ok(()) => {
        match store.complete(&id, &job_id).await {
          Ok(true) => {}
          Ok(false) => tracing::warn!(id = %id, job_id = %job_id, "delivered row lost its claim"),
          Err(e) => tracing::warn!(id = %id, error = %e, "failed to remove delivered row"),
        }
        if options.log_enabled {
          tracing::info!(id = %id, url = %options.url, "pending request sent");
        }
        Delivery::Sent
      }
      Err(e) if e.is_permanent() => {
        tracing::warn!(id = %id, error = %e, "pending request failed permanently");
        match store.mark_failed(&id, Some(&job_id), &e.to_string()).await {
          Ok(true) => {}
          Ok(false) => tracing::warn!(id = %id, job_id = %job_id, "failed row lost its claim"),
          Err(e) => tracing::warn!(id = %id, error = %e, "failed to park outbox row"),
        }
        Delivery::Failed
      }
      Err(e) => {
        tracing::debug!(id = %id, error = %e, "pending request failed, releasing claim");
        if let Err(e) = store.release(&id, &job_id).await {
          tracing::warn!(id = %id, error = %e, "failed to release outbox claim");
        }
        Delivery::Released
      }
    }
  }

  async fn execute(&self, options: &RequestOptions) -> Result<()> {
    self
      .ctx
      .transport()
      .execute(options)
      .await
      .map(|_| ())
      .map_err(Error::from)
  }

  /// Release every claim. Meant for process start, to recover rows left
  /// claimed by a process that died mid-send.
  pub async fn clear_jobs(&self) -> Result<usize> {
    let released = self.ctx.store().clear_jobs().await?;
    if released > 0 {
      tracing::info!(released, "released orphaned outbox claims");
    }
    Ok(released)
  }

  /// Make permanently failed rows eligible for replay again.
  pub async fn retry_failed(&self) -> Result<usize> {
    self.ctx.store().retry_failed().await
  }

  pub async fn list_pending(&self) -> Result<Vec<PendingEntry>> {
    self.ctx.store().pending_entries().await
  }

  /// Replay whenever the network comes back.
  pub fn spawn_replay_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
    let service = Arc::clone(self);
    let mut rx = self.ctx.connectivity().subscribe();

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        if state != NetworkState::Online {
          continue;
        }
        if let Err(e) = service.send_all().await {
          tracing::warn!(error = %e, "outbox replay failed");
        }
      }
    })
  }

  /// Recover orphaned claims, replay now if online, and keep replaying on
  /// every reconnect. Returns the reconnect watcher.
  pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
    self.clear_jobs().await?;
    let watcher = self.spawn_replay_on_reconnect();
    if !self.ctx.is_offline() {
      if let Err(e) = self.send_all().await {
        tracing::warn!(error = %e, "initial outbox replay failed");
      }
    }
    Ok(watcher)
  }
}

#[async_trait]
impl Requestable for OfflineRequestService {
  async fn request(&self, path: &str, init: RequestInit) -> Result<ServiceResult> {
    let options = self.ctx.endpoint().request_options(path, init);
    self.send_request(options).await
  }
}
