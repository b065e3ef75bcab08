use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "curio-sync";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub sync: SyncSettings,
  pub location: LocationSettings,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Root of the content API, e.g. "https://api.example.com/v1/"
  pub base_url: String,
  /// Sent as X-Device-ID so the remote can tell installations apart
  pub device_id: Option<String>,
  pub user_agent: String,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8080/api/".to_string(),
      device_id: None,
      user_agent: format!("curio-sync/{}", env!("CARGO_PKG_VERSION")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  /// Number of queue workers
  pub workers: usize,
  pub request_timeout_secs: u64,
  pub storage_timeout_secs: u64,
  pub backoff_base_ms: u64,
  pub backoff_cap_ms: u64,
  /// Failures after which a task is dropped and reported
  pub max_attempts: u32,
  /// Age after which a region is refreshed on read or on resync
  pub region_staleness_secs: u64,
  pub refresh_on_read: bool,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      workers: 2,
      request_timeout_secs: 10,
      storage_timeout_secs: 10,
      backoff_base_ms: 1_000,
      backoff_cap_ms: 300_000,
      max_attempts: 5,
      region_staleness_secs: 3_600,
      refresh_on_read: true,
    }
  }
}

impl SyncSettings {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn storage_timeout(&self) -> Duration {
    Duration::from_secs(self.storage_timeout_secs)
  }

  pub fn backoff_base(&self) -> Duration {
    Duration::from_millis(self.backoff_base_ms)
  }

  pub fn backoff_cap(&self) -> Duration {
    Duration::from_millis(self.backoff_cap_ms)
  }

  pub fn region_staleness(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.region_staleness_secs as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
  /// Edge length of a grid cell in degrees
  pub cell_size_deg: f64,
  /// A cell is refetched when it has not been synced for this long
  pub staleness_secs: u64,
  /// Samples less accurate than this are ignored
  pub max_accuracy_m: f64,
}

impl Default for LocationSettings {
  fn default() -> Self {
    Self {
      cell_size_deg: 0.01,
      staleness_secs: 3_600,
      max_accuracy_m: 100.0,
    }
  }
}

impl LocationSettings {
  pub fn staleness(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.staleness_secs as i64)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file; defaults to the user data directory
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./curio-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/curio-sync/config.yaml
  ///
  /// Without any file the defaults are used.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("curio-sync.yaml");
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

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.workers == 0 {
      return Err(eyre!("sync.workers must be at least 1"));
    }
    if self.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    if self.sync.backoff_cap_ms < self.sync.backoff_base_ms {
      return Err(eyre!(
        "sync.backoff_cap_ms ({}) is below sync.backoff_base_ms ({})",
        self.sync.backoff_cap_ms,
        self.sync.backoff_base_ms
      ));
    }
    let size = self.location.cell_size_deg;
    if !size.is_finite() || size <= 0.0 || size > 180.0 {
      return Err(eyre!("location.cell_size_deg must be in (0, 180], got {}", size));
    }
    Ok(())
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks CURIO_SYNC_TOKEN first, then CURIO_API_TOKEN as fallback.
  /// Anonymous access is allowed, so a missing token is not an error.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CURIO_SYNC_TOKEN")
      .or_else(|_| std::env::var("CURIO_API_TOKEN"))
      .ok()
      .filter(|token| !token.is_empty())
  }

  /// Where the record store lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }
    Ok(Self::data_dir()?.join("cache.db"))
  }

  /// Directory for rolling log files.
  pub fn log_dir() -> Result<PathBuf> {
    Ok(Self::data_dir()?.join("logs"))
  }

  fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
      .map(|dir| dir.join(APP_DIR))
      .ok_or_else(|| eyre!("Could not determine the user data directory"))
  }
}
