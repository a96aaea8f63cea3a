use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheSettings, CacheSettingsPatch, SqliteKvStore};
use crate::github::GITHUB_API_BASE;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub durable: DurableConfig,
  pub github: GitHubConfig,
  /// Overrides for the repository statistics cache
  pub stats: CacheSettingsPatch,
  /// Overrides for the avatar cache
  pub avatars: CacheSettingsPatch,
  /// Local fallback database (defaults to the user data directory)
  pub local_db: Option<PathBuf>,
  /// Time allowed for flushing pending writes on shutdown
  #[serde(with = "humantime_serde")]
  pub shutdown_budget: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      durable: DurableConfig::default(),
      github: GitHubConfig::default(),
      stats: CacheSettingsPatch::default(),
      avatars: CacheSettingsPatch::default(),
      local_db: None,
      shutdown_budget: Duration::from_secs(2),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DurableBackend {
  /// SQLite table in a local file
  #[default]
  Sqlite,
  /// PostgREST endpoint (e.g. Supabase)
  Postgrest,
  /// No durable tier
  #[serde(rename = "none")]
  Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
  pub backend: DurableBackend,
  /// PostgREST base url, e.g. https://xyz.supabase.co/rest/v1
  pub url: Option<String>,
  /// SQLite file for the sqlite backend (defaults next to the local db)
  pub path: Option<PathBuf>,
  pub stats_table: String,
  pub avatars_table: String,
}

impl Default for DurableConfig {
  fn default() -> Self {
    Self {
      backend: DurableBackend::default(),
      url: None,
      path: None,
      stats_table: "repo_stats_cache".to_string(),
      avatars_table: "avatar_cache".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
  pub api_url: String,
}

impl Default for GitHubConfig {
  fn default() -> Self {
    Self {
      api_url: GITHUB_API_BASE.to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./contrib-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/contrib-cache/config.yaml
  ///
  /// Without a file the defaults apply.
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
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("contrib-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("contrib-cache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.check()?;
    Ok(config)
  }

  fn check(&self) -> Result<()> {
    if self.durable.backend == DurableBackend::Postgrest && self.durable.url.is_none() {
      return Err(eyre!("durable.url is required for the postgrest backend"));
    }
    for (name, settings) in [("stats", self.stats_settings()), ("avatars", self.avatar_settings())] {
      if settings.max_entries == 0 {
        return Err(eyre!("{}.max_entries must be at least 1", name));
      }
      if settings.batch_size == 0 {
        return Err(eyre!("{}.batch_size must be at least 1", name));
      }
    }
    Ok(())
  }

  /// Settings of the repository statistics cache.
  pub fn stats_settings(&self) -> CacheSettings {
    self.stats.apply(CacheSettings::repo_stats())
  }

  /// Settings of the avatar cache.
  pub fn avatar_settings(&self) -> CacheSettings {
    self.avatars.apply(CacheSettings::avatars())
  }

  /// Path of the local fallback database.
  pub fn local_db_path(&self) -> Result<PathBuf> {
    match &self.local_db {
      Some(path) => Ok(path.clone()),
      None => SqliteKvStore::default_path().map_err(|e| eyre!("{}", e)),
    }
  }

  /// Path of the SQLite durable store.
  pub fn durable_db_path(&self) -> Result<PathBuf> {
    match &self.durable.path {
      Some(path) => Ok(path.clone()),
      None => Ok(self.local_db_path()?.with_file_name("durable.db")),
    }
  }

  /// Get the durable store API key from environment variables.
  ///
  /// Checks CONTRIB_CACHE_DURABLE_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_durable_key() -> Result<String> {
    std::env::var("CONTRIB_CACHE_DURABLE_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!(
          "Durable store key not found. Set CONTRIB_CACHE_DURABLE_KEY or SUPABASE_ANON_KEY environment variable."
        )
      })
  }
}
