//! Explicitly constructed owner of the repository statistics and avatar caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{
  CacheLayer, Clock, DurableStore, FlushReport, KeyValueStore, LayerStats, NoopStorage,
  PostgrestStore, SqliteDurableStore, SqliteKvStore, SystemClock, Tiers,
};
use crate::config::{Config, DurableBackend};
use crate::error::CacheError;
use crate::github::{
  AvatarFetcher, AvatarKey, AvatarSource, GitHubClient, RepoSource, RepoStatsFetcher,
  RepoStatsKey,
};

pub type StatsCache<R = GitHubClient> = CacheLayer<RepoStatsKey, RepoStatsFetcher<R>>;
pub type AvatarCache<A = GitHubClient> = CacheLayer<AvatarKey, AvatarFetcher<A>>;

/// Counters for both caches.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
  pub stats: LayerStats,
  pub avatars: LayerStats,
}

/// What the shutdown flush managed to write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
  pub stats: FlushReport,
  pub avatars: FlushReport,
}

/// The caches of one process.
///
/// Created once with [`create`](CacheService::create) and torn down with
/// [`dispose`](CacheService::dispose), which flushes pending durable writes
/// within the configured budget.
pub struct CacheService<R: RepoSource = GitHubClient, A: AvatarSource = GitHubClient> {
  stats: StatsCache<R>,
  avatars: AvatarCache<A>,
  kv: Arc<dyn KeyValueStore>,
  shutdown_budget: Duration,
  disposed: AtomicBool,
}

impl CacheService {
  /// Build both caches from configuration.
  ///
  /// An unusable local database degrades to no fallback tier rather than
  /// failing, like any other tier error.
  pub fn create(config: &Config) -> Result<Self> {
    let kv: Arc<dyn KeyValueStore> = match config
      .local_db_path()
      .and_then(|path| SqliteKvStore::open_at(&path).map_err(|e| eyre!("{}", e)))
    {
      Ok(store) => Arc::new(store),
      Err(e) => {
        warn!(error = %e, "Local fallback store unavailable, continuing without it");
        Arc::new(NoopStorage)
      }
    };

    let (stats_store, avatar_store) = open_durable(config)?;
    let github = GitHubClient::from_env(&config.github.api_url).map_err(|e| eyre!("{}", e))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tiers = |durable: Option<Arc<dyn DurableStore>>| {
      let tiers = Tiers::default().with_kv(kv.clone()).with_clock(clock.clone());
      match durable {
        Some(store) => tiers.with_durable(store),
        None => tiers,
      }
    };
    let stats = CacheLayer::new(
      "repo_stats",
      config.stats_settings(),
      RepoStatsFetcher::new(github.clone(), clock.clone()),
      tiers(stats_store),
    );
    let avatars = CacheLayer::new(
      "avatar",
      config.avatar_settings(),
      AvatarFetcher::new(github),
      tiers(avatar_store),
    );

    info!(durable = ?config.durable.backend, "Cache service created");
    Ok(Self::from_parts(stats, avatars, kv, config.shutdown_budget))
  }
}

type DurablePair = (Option<Arc<dyn DurableStore>>, Option<Arc<dyn DurableStore>>);

fn open_durable(config: &Config) -> Result<DurablePair> {
  let durable = &config.durable;
  match durable.backend {
    DurableBackend::Disabled => Ok((None, None)),
    DurableBackend::Sqlite => {
      let path = config.durable_db_path()?;
      let open = |table: &str| -> Result<Option<Arc<dyn DurableStore>>> {
        let store = SqliteDurableStore::open_at(&path, table).map_err(|e| eyre!("{}", e))?;
        Ok(Some(Arc::new(store)))
      };
      Ok((open(&durable.stats_table)?, open(&durable.avatars_table)?))
    }
    DurableBackend::Postgrest => {
      let url = durable
        .url
        .as_deref()
        .ok_or_else(|| eyre!("durable.url is required for the postgrest backend"))?;
      let key = Config::get_durable_key()?;
      let open = |table: &str| -> Result<Option<Arc<dyn DurableStore>>> {
        let store = PostgrestStore::new(url, &key, table).map_err(|e| eyre!("{}", e))?;
        Ok(Some(Arc::new(store)))
      };
      Ok((open(&durable.stats_table)?, open(&durable.avatars_table)?))
    }
  }
}

impl<R: RepoSource, A: AvatarSource> CacheService<R, A> {
  pub fn from_parts(
    stats: StatsCache<R>,
    avatars: AvatarCache<A>,
    kv: Arc<dyn KeyValueStore>,
    shutdown_budget: Duration,
  ) -> Self {
    Self {
      stats,
      avatars,
      kv,
      shutdown_budget,
      disposed: AtomicBool::new(false),
    }
  }

  pub fn stats_cache(&self) -> &StatsCache<R> {
    &self.stats
  }

  pub fn avatar_cache(&self) -> &AvatarCache<A> {
    &self.avatars
  }

  pub fn stats(&self) -> ServiceStats {
    ServiceStats {
      stats: self.stats.stats(),
      avatars: self.avatars.stats(),
    }
  }

  /// Write pending durable records of both caches now.
  pub async fn flush(&self) -> ShutdownReport {
    let (stats, avatars) = tokio::join!(self.stats.flush(), self.avatars.flush());
    ShutdownReport { stats, avatars }
  }

  /// Shutdown hook: flush pending writes within the shutdown budget.
  ///
  /// Records that cannot be written in time go out through the durable
  /// store's fire-and-forget transport. Only the first call does any work.
  pub async fn dispose(&self) -> ShutdownReport {
    if self.disposed.swap(true, Ordering::SeqCst) {
      return ShutdownReport::default();
    }
    let budget = self.shutdown_budget;
    let (stats, avatars) = tokio::join!(self.stats.shutdown(budget), self.avatars.shutdown(budget));
    info!(
      written = stats.written + avatars.written,
      beaconed = stats.beaconed + avatars.beaconed,
      failed = stats.failed + avatars.failed,
      "Cache service disposed",
    );
    ShutdownReport { stats, avatars }
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::SeqCst)
  }

  /// Drop all memory entries and the local fallback store.
  pub fn clear_local(&self) -> std::result::Result<(), CacheError> {
    self.stats.clear_memory();
    self.avatars.clear_memory();
    self.kv.clear()
  }
}
