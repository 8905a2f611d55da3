use color_eyre::{eyre::eyre, Result};
use offline_call::codec::TransformKind;
use offline_call::db::{Database, DB_FILE_NAME};
use offline_call::request::ServiceEndpoint;
use offline_call::service::ServeFrom;
use offline_call::store::StoreOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "offline-call";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Log queued and cached requests at info level
  #[serde(default)]
  pub log_requests: bool,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  #[serde(default)]
  pub transform: TransformKind,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub serve_from: ServeFrom,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// URL probed to detect connectivity (defaults to the API base URL)
  pub probe_url: Option<String>,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

fn default_probe_interval_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Used when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write a daily-rolling log file
  #[serde(default)]
  pub file: bool,
  /// Log directory (defaults to the user data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: false,
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-call.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-call/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-call/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-call.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks OFFLINE_CALL_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OFFLINE_CALL_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn store_options(&self) -> Result<StoreOptions> {
    let path = match &self.store.path {
      Some(path) => path.clone(),
      None => Database::default_path()?,
    };
    Ok(StoreOptions::at(path).with_transform(self.store.transform.build()))
  }

  pub fn endpoint(&self, token: Option<&str>) -> ServiceEndpoint {
    let mut endpoint = ServiceEndpoint::new(&self.api.base_url).with_logging(self.api.log_requests);
    for (name, value) in &self.api.headers {
      endpoint = endpoint.with_header(name, value);
    }
    if let Some(token) = token {
      endpoint = endpoint.with_header("Authorization", format!("Bearer {}", token));
    }
    endpoint
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn probe_url(&self) -> &str {
    self
      .connectivity
      .probe_url
      .as_deref()
      .unwrap_or(&self.api.base_url)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_interval_secs.max(1))
  }

  /// Directory for log files.
  pub fn log_directory(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.directory {
      return Ok(dir.clone());
    }
    let default = Database::default_path()?;
    default
      .parent()
      .map(Path::to_path_buf)
      .ok_or_else(|| eyre!("No parent directory for {}", DB_FILE_NAME))
  }
}
