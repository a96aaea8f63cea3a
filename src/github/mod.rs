//! GitHub API module.
//! Provides the client plus the repository statistics and avatar caches
//! built on it.

pub mod avatar;
pub mod client;
pub mod stats;
pub mod types;

pub use avatar::{check_avatar_url, default_avatar_url, AvatarFetcher, AvatarKey, AvatarSource, AvatarUrl};
pub use client::{GitHubClient, RateLimit, GITHUB_API_BASE};
pub use stats::{
  direct_commits, lottery_factor, DirectCommits, LotteryFactor, RepoSource, RepoStats,
  RepoStatsFetcher, RepoStatsKey, Risk,
};
