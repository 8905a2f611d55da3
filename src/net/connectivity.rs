//! Online/offline state shared between the engines and whatever observes the
//! network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
  Online,
  Offline,
}

/// Cloneable handle to the current network state.
///
/// Every clone observes the same state. Subscribers are woken on each
/// transition, never on a repeated report of the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<NetworkState>>,
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(NetworkState::Online)
  }
}

impl Connectivity {
  pub fn new(initial: NetworkState) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn state(&self) -> NetworkState {
    *self.tx.borrow()
  }

  pub fn is_offline(&self) -> bool {
    self.state() == NetworkState::Offline
  }

  /// Publish `state`. Returns true if this was a transition.
  pub fn set(&self, state: NetworkState) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    })
  }

  pub fn set_online(&self, online: bool) -> bool {
    self.set(if online {
      NetworkState::Online
    } else {
      NetworkState::Offline
    })
  }

  /// Receive every subsequent transition.
  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.tx.subscribe()
  }
}

/// Periodically checks whether a URL is reachable and publishes the result.
///
/// Any HTTP response counts as online; only a failure to get one (DNS,
/// connect, timeout) counts as offline.
pub struct ConnectivityProbe {
  client: reqwest::Client,
  url: String,
  interval: Duration,
}

impl ConnectivityProbe {
  pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      url: url.into(),
      interval,
    })
  }

  /// Probe once.
  pub async fn check(&self) -> NetworkState {
    match self.client.head(&self.url).send().await {
      Ok(_) => NetworkState::Online,
      Err(e) => {
        tracing::debug!(url = %self.url, error = %e, "connectivity probe failed");
        NetworkState::Offline
      }
    }
  }

  /// Probe forever on a fixed interval, publishing into `connectivity`.
  pub fn spawn(self, connectivity: Connectivity) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        let state = self.check().await;
        if connectivity.set(state) {
          tracing::info!(?state, "network state changed");
        }
      }
    })
  }
}
