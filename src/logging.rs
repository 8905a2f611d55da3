use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

const LOG_FILE_PREFIX: &str = "offline-call.log";

/// Install the global subscriber: stderr always, plus a daily-rolling file
/// when enabled. Keep the returned guard alive until exit or buffered file
/// lines are lost.
pub fn init(config: &Config) -> Result<Option<WorkerGuard>> {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

  let (file_layer, guard) = if config.log.file {
    let directory = config.log_directory()?;
    std::fs::create_dir_all(&directory)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
    let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
      .with_writer(writer)
      .with_ansi(false);
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to init subscriber: {}", e))?;

  Ok(guard)
}
