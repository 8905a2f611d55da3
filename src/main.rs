mod config;
mod logging;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offline_call::net::{Connectivity, ConnectivityProbe, HttpTransport};
use offline_call::request::RequestInit;
use offline_call::service::{
  OfflineRequestService, OfflineResponseService, Requestable, ServiceContext, ServiceResult,
};
use offline_call::store::PendingState;

#[derive(Parser, Debug)]
#[command(name = "offline-call")]
#[command(about = "Queue API calls while offline and serve cached responses")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-call/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send a request, queueing it if the network is down
  Request {
    /// Path relative to the API base URL, or an absolute URL
    path: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header as NAME:VALUE (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Query parameter as NAME=VALUE (repeatable)
    #[arg(short, long = "query")]
    query: Vec<String>,
    /// Go through the response cache instead of the outbox
    #[arg(long)]
    cached: bool,
  },
  /// Replay every queued request now
  SendAll,
  /// Release claims left behind by an interrupted replay
  ClearJobs,
  /// Make permanently failed requests eligible for replay again
  RetryFailed,
  /// List queued requests
  Pending,
  /// Delete the cache and the outbox
  DropTables {
    /// Required, the deletion cannot be undone
    #[arg(long)]
    yes: bool,
  },
  /// Probe connectivity and replay the outbox on every reconnect until Ctrl-C
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config)?;

  let token = config::Config::get_api_token();
  let transport = Arc::new(HttpTransport::new(config.timeout())?);
  let probe = ConnectivityProbe::new(config.probe_url(), config.probe_interval(), config.timeout())?;
  let connectivity = Connectivity::new(probe.check().await);
  tracing::debug!(state = ?connectivity.state(), "initial connectivity");

  let ctx = ServiceContext::configure(
    &config.store_options()?,
    transport,
    connectivity.clone(),
    config.endpoint(token.as_deref()),
  )?;
  let outbox = Arc::new(OfflineRequestService::new(Arc::clone(&ctx)));

  match args.command {
    Command::Request {
      path,
      method,
      data,
      headers,
      query,
      cached,
    } => {
      let init = request_init(method, data, headers, query)?;
      let result = if cached {
        let responses = OfflineResponseService::new(Arc::clone(&ctx))
          .serve_from(config.cache.serve_from)
          .with_request_cleaner(|mut options| {
            options.remove_header("Authorization");
            options
          });
        let result = responses.request(&path, init).await;
        responses.flush().await;
        result?
      } else {
        outbox.request(&path, init).await?
      };
      print_result(&result)?;
    }
    Command::SendAll => {
      if connectivity.is_offline() {
        return Err(eyre!("Offline, nothing sent"));
      }
      let summary = outbox.send_all().await?;
      println!(
        "sent: {}, released: {}, failed: {}",
        summary.sent, summary.released, summary.failed
      );
    }
    Command::ClearJobs => {
      println!("released {} claims", outbox.clear_jobs().await?);
    }
    Command::RetryFailed => {
      println!("{} requests eligible again", outbox.retry_failed().await?);
    }
    Command::Pending => {
      for entry in outbox.list_pending().await? {
        let timestamp = entry
          .timestamp
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| "-".to_string());
        let state = match entry.state {
          PendingState::Unclaimed => "unclaimed".to_string(),
          PendingState::Claimed { job_id } => format!("claimed by {}", job_id),
          PendingState::Failed { reason } => format!("failed: {}", reason),
        };
        println!("{}  {}  {}", entry.id, timestamp, state);
      }
    }
    Command::DropTables { yes } => {
      if !yes {
        return Err(eyre!("Refusing to drop tables without --yes"));
      }
      ctx.drop_all_tables().await?;
      println!("dropped all tables");
    }
    Command::Watch => {
      let replay = outbox.start().await?;
      let probing = probe.spawn(connectivity.clone());
      tracing::info!("watching connectivity, press Ctrl-C to stop");

      tokio::signal::ctrl_c().await?;
      probing.abort();
      replay.abort();
      tracing::info!("stopped");
    }
  }

  ctx.close_store().await?;
  Ok(())
}

fn request_init(
  method: String,
  data: Option<String>,
  headers: Vec<String>,
  query: Vec<String>,
) -> Result<RequestInit> {
  let mut init = RequestInit::default().method(method);
  if let Some(data) = data {
    let body =
      serde_json::from_str(&data).map_err(|e| eyre!("Request body is not valid JSON: {}", e))?;
    init = init.body(body);
  }
  for (name, value) in split_pairs(&headers, ':')? {
    init = init.header(name, value);
  }
  for (name, value) in split_pairs(&query, '=')? {
    init = init.query(name, value);
  }
  Ok(init)
}

fn split_pairs(items: &[String], separator: char) -> Result<BTreeMap<String, String>> {
  items
    .iter()
    .map(|item| {
      item
        .split_once(separator)
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| eyre!("Expected NAME{}VALUE, got '{}'", separator, item))
    })
    .collect()
}

fn print_result(result: &ServiceResult) -> Result<()> {
  match &result.cached_at {
    Some(at) => eprintln!("source: {:?} (stored {})", result.source, at.to_rfc3339()),
    None => eprintln!("source: {:?}", result.source),
  }
  if let Some(data) = &result.data {
    println!("{}", serde_json::to_string_pretty(data)?);
  }
  Ok(())
}
