use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

use contrib_cache::cache::GetOptions;
use contrib_cache::config::Config;
use contrib_cache::github::{AvatarKey, RepoStatsKey};
use contrib_cache::logging;
use contrib_cache::service::CacheService;

#[derive(Parser, Debug)]
#[command(name = "contrib-cache")]
#[command(about = "Tiered cache for GitHub repository analytics and avatars")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/contrib-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Mirror log output to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Repository pull request statistics
  Stats {
    owner: String,
    repo: String,
    /// Time range in days
    #[arg(long, default_value_t = 30)]
    range: u32,
    /// Count bot accounts as contributors
    #[arg(long)]
    include_bots: bool,
    /// Skip the cached tiers and ask GitHub
    #[arg(long)]
    force: bool,
  },
  /// Avatar URLs of GitHub accounts
  Avatar {
    #[arg(required = true)]
    ids: Vec<u64>,
    /// URL to use instead of asking GitHub
    #[arg(long)]
    fallback: Option<String>,
  },
  /// Flush pending durable writes and print cache counters
  Flush,
  /// Remove locally cached data
  ClearLocal,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn run(service: &CacheService, command: Command) -> Result<()> {
  match command {
    Command::Stats {
      owner,
      repo,
      range,
      include_bots,
      force,
    } => {
      let key = RepoStatsKey::new(&owner, &repo, range, include_bots);
      let options = if force {
        GetOptions::force_refresh()
      } else {
        GetOptions::default()
      };
      let cache = service.stats_cache();
      let result = cache.get(&key, options).await?;
      print_json(&result)?;

      // Later stages keep filling the record in the background.
      while cache.is_in_flight(&key) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
      }
      if cache.progress(&key) != result.progress {
        let result = cache.get(&key, GetOptions::default()).await?;
        print_json(&result)?;
      }
    }
    Command::Avatar { ids, fallback } => {
      let keys: Vec<AvatarKey> = ids
        .into_iter()
        .map(|id| match &fallback {
          Some(url) => AvatarKey::with_fallback(id, url.clone()),
          None => AvatarKey::new(id),
        })
        .collect();
      let results = service.avatar_cache().get_many(&keys).await;
      let mut urls = Vec::with_capacity(results.len());
      for (key, result) in keys.iter().zip(results) {
        let result = result?;
        urls.push(serde_json::json!({
          "id": key.id,
          "url": result.value,
          "source": result.source,
          "is_stale": result.is_stale,
        }));
      }
      print_json(&urls)?;
    }
    Command::Flush => {
      let report = service.flush().await;
      tracing::info!(
        written = report.stats.written + report.avatars.written,
        "Flushed on request",
      );
      print_json(&service.stats())?;
    }
    Command::ClearLocal => {
      service
        .clear_local()
        .map_err(|e| eyre!("Failed to clear local cache: {}", e))?;
      println!("Local cache cleared");
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init_logging(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let service = CacheService::create(&config)?;

  let outcome = tokio::select! {
    result = run(&service, args.command) => result,
    _ = tokio::signal::ctrl_c() => {
      tracing::info!("Interrupted, flushing pending writes");
      Ok(())
    }
  };

  service.dispose().await;
  outcome
}
