//! Repository statistics: a three-stage origin over the GitHub API.
//!
//! Stage 1 fetches the repository id and pull request counts, which is
//! enough to show the headline numbers. Stage 2 lists the pull requests in the
//! time range and derives the lottery factor. Stage 3 compares the default
//! branch history with the merged pull requests to find direct commits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use super::types::{CommitSummary, PrCounts, PullRequestSummary, RepoSummary};
use crate::cache::{CacheKey, Cacheable, Clock, OriginFetcher, Stage};
use crate::error::{CacheError, Result};

/// Data source behind the repository statistics.
pub trait RepoSource: Send + Sync + 'static {
  fn repository<'a>(&'a self, owner: &'a str, repo: &'a str) -> BoxFuture<'a, Result<RepoSummary>>;

  fn pull_request_counts<'a>(
    &'a self,
    owner: &'a str,
    repo: &'a str,
    since: DateTime<Utc>,
  ) -> BoxFuture<'a, Result<PrCounts>>;

  fn pull_requests<'a>(
    &'a self,
    owner: &'a str,
    repo: &'a str,
    since: DateTime<Utc>,
  ) -> BoxFuture<'a, Result<Vec<PullRequestSummary>>>;

  fn commits<'a>(
    &'a self,
    owner: &'a str,
    repo: &'a str,
    branch: &'a str,
    since: DateTime<Utc>,
  ) -> BoxFuture<'a, Result<Vec<CommitSummary>>>;
}

/// Key of a statistics record: repository, time range in days and whether
/// bot authors count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoStatsKey {
  pub owner: String,
  pub repo: String,
  pub range_days: u32,
  pub include_bots: bool,
}

impl RepoStatsKey {
  pub fn new(owner: &str, repo: &str, range_days: u32, include_bots: bool) -> Self {
    Self {
      owner: owner.to_string(),
      repo: repo.to_string(),
      range_days,
      include_bots,
    }
  }
}

impl CacheKey for RepoStatsKey {
  fn cache_key(&self) -> String {
    format!(
      "{}/{}/{}/{}",
      self.owner, self.repo, self.range_days, self.include_bots
    )
  }

  fn description(&self) -> String {
    format!("{}/{} ({} days)", self.owner, self.repo, self.range_days)
  }
}

/// Risk that a project stalls if its top contributors leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
  Low,
  Medium,
  High,
}

/// Share of pull requests authored by one contributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributorShare {
  pub login: String,
  pub pr_count: u64,
  pub percentage: f64,
}

/// Smallest number of contributors that authored at least half of all pull
/// requests in the range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotteryFactor {
  pub factor: usize,
  pub risk: Risk,
  pub total_prs: u64,
  pub contributors: Vec<ContributorShare>,
}

/// Commits that reached the default branch without a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectCommits {
  pub total_commits: u64,
  pub direct_commits: u64,
  pub percentage: f64,
  pub authors: Vec<DirectCommitAuthor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectCommitAuthor {
  pub login: String,
  pub commits: u64,
}

/// Statistics record. Each stage fills its own fields; absent fields are
/// not yet known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoStats {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default_branch: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_count: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub merged_pr_count: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pull_requests: Option<Vec<PullRequestSummary>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub contributor_count: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lottery_factor: Option<LotteryFactor>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub direct_commits: Option<DirectCommits>,
}

impl Cacheable for RepoStats {
  fn entity_type() -> &'static str {
    "repo_stats"
  }
}

/// Compute the lottery factor of a set of pull requests.
///
/// Contributors are ranked by pull request count (ties by login). Returns
/// `None` when there are no pull requests.
pub fn lottery_factor(prs: &[PullRequestSummary]) -> Option<LotteryFactor> {
  if prs.is_empty() {
    return None;
  }
  let mut counts: HashMap<&str, u64> = HashMap::new();
  for pr in prs {
    *counts.entry(pr.author.as_str()).or_default() += 1;
  }
  let mut ranked: Vec<(&str, u64)> = counts.into_iter().collect();
  ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

  let total = prs.len() as u64;
  let mut covered = 0;
  let mut contributors = Vec::new();
  for (login, count) in ranked {
    covered += count;
    contributors.push(ContributorShare {
      login: login.to_string(),
      pr_count: count,
      percentage: count as f64 * 100.0 / total as f64,
    });
    if covered * 2 >= total {
      break;
    }
  }

  let factor = contributors.len();
  let risk = match factor {
    0..=2 => Risk::High,
    3..=4 => Risk::Medium,
    _ => Risk::Low,
  };
  Some(LotteryFactor {
    factor,
    risk,
    total_prs: total,
    contributors,
  })
}

/// Find commits on the branch that are not the merge result of a pull request.
///
/// Merge commits themselves are not counted.
pub fn direct_commits(
  commits: &[CommitSummary],
  prs: &[PullRequestSummary],
  include_bots: bool,
) -> DirectCommits {
  let merged: HashSet<&str> = prs
    .iter()
    .filter(|pr| pr.merged)
    .filter_map(|pr| pr.merge_commit_sha.as_deref())
    .collect();

  let considered: Vec<&CommitSummary> = commits
    .iter()
    .filter(|c| !c.is_merge && (include_bots || !c.author_is_bot))
    .collect();
  let mut by_author: HashMap<&str, u64> = HashMap::new();
  for commit in considered.iter().filter(|c| !merged.contains(c.sha.as_str())) {
    *by_author.entry(commit.author.as_str()).or_default() += 1;
  }

  let total = considered.len() as u64;
  let direct: u64 = by_author.values().sum();
  let mut authors: Vec<DirectCommitAuthor> = by_author
    .into_iter()
    .map(|(login, commits)| DirectCommitAuthor {
      login: login.to_string(),
      commits,
    })
    .collect();
  authors.sort_by(|a, b| b.commits.cmp(&a.commits).then(a.login.cmp(&b.login)));

  DirectCommits {
    total_commits: total,
    direct_commits: direct,
    percentage: if total == 0 {
      0.0
    } else {
      direct as f64 * 100.0 / total as f64
    },
    authors,
  }
}

/// Staged origin for [`RepoStats`].
pub struct RepoStatsFetcher<S: RepoSource> {
  source: S,
  clock: Arc<dyn Clock>,
}

impl<S: RepoSource> RepoStatsFetcher<S> {
  pub fn new(source: S, clock: Arc<dyn Clock>) -> Self {
    Self { source, clock }
  }

  fn since(&self, key: &RepoStatsKey) -> DateTime<Utc> {
    let range = Duration::from_secs(u64::from(key.range_days) * 24 * 60 * 60);
    let now = self.clock.now();
    chrono::Duration::from_std(range)
      .ok()
      .and_then(|d| now.checked_sub_signed(d))
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  async fn critical(&self, key: &RepoStatsKey) -> Result<RepoStats> {
    let since = self.since(key);
    let (repo, counts) = futures::try_join!(
      self.source.repository(&key.owner, &key.repo),
      self.source.pull_request_counts(&key.owner, &key.repo, since),
    )?;
    Ok(RepoStats {
      id: Some(repo.id),
      default_branch: Some(repo.default_branch),
      pr_count: Some(counts.opened),
      merged_pr_count: Some(counts.merged),
      ..RepoStats::default()
    })
  }

  async fn full(&self, key: &RepoStatsKey) -> Result<RepoStats> {
    let prs: Vec<PullRequestSummary> = self
      .source
      .pull_requests(&key.owner, &key.repo, self.since(key))
      .await?
      .into_iter()
      .filter(|pr| key.include_bots || !pr.author_is_bot)
      .collect();
    let contributors: HashSet<&str> = prs.iter().map(|pr| pr.author.as_str()).collect();
    Ok(RepoStats {
      contributor_count: Some(contributors.len() as u64),
      lottery_factor: lottery_factor(&prs),
      pull_requests: Some(prs),
      ..RepoStats::default()
    })
  }

  async fn enhancement(&self, key: &RepoStatsKey, prior: Option<&RepoStats>) -> Result<RepoStats> {
    let (branch, prs) = match prior {
      Some(RepoStats {
        default_branch: Some(branch),
        pull_requests: Some(prs),
        ..
      }) => (branch.as_str(), prs.as_slice()),
      _ => {
        return Err(CacheError::origin(
          "direct commit analysis needs the branch and pull requests",
        ))
      }
    };
    let commits = self
      .source
      .commits(&key.owner, &key.repo, branch, self.since(key))
      .await?;
    Ok(RepoStats {
      direct_commits: Some(direct_commits(&commits, prs, key.include_bots)),
      ..RepoStats::default()
    })
  }
}

impl<S: RepoSource> OriginFetcher<RepoStatsKey> for RepoStatsFetcher<S> {
  type Value = RepoStats;

  fn stages(&self) -> &[Stage] {
    &Stage::ALL
  }

  fn fetch_stage<'a>(
    &'a self,
    key: &'a RepoStatsKey,
    stage: Stage,
    prior: Option<&'a RepoStats>,
  ) -> BoxFuture<'a, Result<RepoStats>> {
    match stage {
      Stage::Critical => self.critical(key).boxed(),
      Stage::Full => self.full(key).boxed(),
      Stage::Enhancement => self.enhancement(key, prior).boxed(),
    }
  }

  fn validate(&self, key: &RepoStatsKey, value: RepoStats) -> Result<RepoStats> {
    if let (Some(opened), Some(merged)) = (value.pr_count, value.merged_pr_count) {
      if merged > opened {
        return Err(CacheError::validation(format!(
          "{}: {} merged pull requests out of {}",
          key.cache_key(),
          merged,
          opened
        )));
      }
    }
    Ok(value)
  }
}
