//! GitHub REST API client.
//! Handles authentication, pagination and rate limit tracking.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{
  header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT},
  Client, Response, StatusCode,
};
use serde::de::DeserializeOwned;

use super::avatar::AvatarSource;
use super::stats::RepoSource;
use super::types::{
  ApiCommit, ApiPullRequest, ApiRepository, ApiSearchCount, ApiUser, CommitSummary, PrCounts,
  PullRequestSummary, RepoSummary,
};
use crate::error::{CacheError, Result};

pub const GITHUB_API_BASE: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const PER_PAGE: usize = 100;
/// Upper bound on pages fetched for one listing.
const MAX_PAGES: usize = 10;

/// Rate limit state from the last response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
  pub limit: u32,
  pub remaining: u32,
  pub reset: u64,
}

/// GitHub API client. Cloning shares the connection pool and rate limit state.
#[derive(Clone)]
pub struct GitHubClient {
  client: Client,
  base_url: String,
  rate_limit: Arc<Mutex<Option<RateLimit>>>,
}

impl GitHubClient {
  /// Create a client against `base_url`, authenticated when a token is given.
  pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
    let mut headers = HeaderMap::new();

    if let Some(token) = token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| CacheError::origin(format!("invalid GitHub token: {}", e)))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }
    headers.insert(
      ACCEPT,
      HeaderValue::from_static("application/vnd.github+json"),
    );
    headers.insert(
      "X-GitHub-Api-Version",
      HeaderValue::from_static(GITHUB_API_VERSION),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static("contrib-cache"));

    let client = Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| CacheError::origin(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      rate_limit: Arc::new(Mutex::new(None)),
    })
  }

  /// Create a client using the `GITHUB_TOKEN` environment variable if set.
  pub fn from_env(base_url: &str) -> Result<Self> {
    let token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
    if token.is_none() {
      tracing::warn!("GITHUB_TOKEN is not set, using unauthenticated GitHub requests");
    }
    Self::new(base_url, token.as_deref())
  }

  /// Rate limit reported by the most recent response.
  pub fn rate_limit(&self) -> Option<RateLimit> {
    self.rate_limit.lock().ok().and_then(|r| *r)
  }

  /// GET `endpoint` and decode the JSON body.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    endpoint: &str,
    params: &[(&str, String)],
  ) -> Result<T> {
    let url = format!("{}{}", self.base_url, endpoint);
    let response = self
      .client
      .get(&url)
      .query(params)
      .send()
      .await
      .map_err(|e| CacheError::origin(format!("GET {}: {}", endpoint, e)))?;

    self.update_rate_limit(&response);
    let response = self.check_response(response).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| CacheError::origin(format!("GET {}: invalid body: {}", endpoint, e)))
  }

  /// GET every page of a listing, stopping early once `keep_going` says so.
  async fn get_pages<T, P>(
    &self,
    endpoint: &str,
    params: &[(&str, String)],
    mut keep_going: P,
  ) -> Result<Vec<T>>
  where
    T: DeserializeOwned,
    P: FnMut(&[T]) -> bool,
  {
    let mut items = Vec::new();
    for page in 1..=MAX_PAGES {
      let mut query = params.to_vec();
      query.push(("per_page", PER_PAGE.to_string()));
      query.push(("page", page.to_string()));

      let batch: Vec<T> = self.get_json(endpoint, &query).await?;
      let full_page = batch.len() == PER_PAGE;
      let more = keep_going(&batch);
      items.extend(batch);
      if !full_page || !more {
        break;
      }
    }
    Ok(items)
  }

  fn update_rate_limit(&self, response: &Response) {
    let header = |name: &str| {
      response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    };
    let (Some(limit), Some(remaining), Some(reset)) = (
      header("x-ratelimit-limit"),
      header("x-ratelimit-remaining"),
      header("x-ratelimit-reset"),
    ) else {
      return;
    };
    if let Ok(mut rate_limit) = self.rate_limit.lock() {
      *rate_limit = Some(RateLimit {
        limit: limit as u32,
        remaining: remaining as u32,
        reset,
      });
    }
  }

  async fn check_response(&self, response: Response) -> Result<Response> {
    match response.status() {
      StatusCode::OK => Ok(response),
      StatusCode::UNAUTHORIZED => Err(CacheError::origin(
        "GitHub authentication failed: invalid or expired token",
      )),
      StatusCode::NOT_FOUND => Err(CacheError::origin(format!(
        "GitHub resource not found: {}",
        response.url()
      ))),
      StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        if self.rate_limit().map(|r| r.remaining == 0).unwrap_or(false) =>
      {
        let reset_at = self
          .rate_limit()
          .and_then(|r| DateTime::from_timestamp(r.reset as i64, 0))
          .map(|dt| dt.format("%H:%M:%S").to_string())
          .unwrap_or_else(|| "unknown".to_string());
        Err(CacheError::origin(format!(
          "GitHub rate limit exceeded, resets at {}",
          reset_at
        )))
      }
      status => Err(CacheError::origin(format!(
        "GitHub HTTP {}: {}",
        status,
        response.text().await.unwrap_or_default()
      ))),
    }
  }

  async fn search_count(&self, query: String) -> Result<u64> {
    let result: ApiSearchCount = self
      .get_json("/search/issues", &[("q", query), ("per_page", "1".to_string())])
      .await?;
    Ok(result.total_count)
  }
}

fn since_date(since: DateTime<Utc>) -> String {
  since.format("%Y-%m-%d").to_string()
}

impl RepoSource for GitHubClient {
  fn repository<'a>(&'a self, owner: &'a str, repo: &'a str) -> BoxFuture<'a, Result<RepoSummary>> {
    async move {
      let repository: ApiRepository = self
        .get_json(&format!("/repos/{}/{}", owner, repo), &[])
        .await?;
      Ok(repository.into())
    }
    .boxed()
  }

  fn pull_request_counts<'a>(
    &'a self,
    owner: &'a str,
    repo: &'a str,
    since: DateTime<Utc>,
  ) -> BoxFuture<'a, Result<PrCounts>> {
    async move {
      let base = format!("repo:{}/{} is:pr created:>={}", owner, repo, since_date(since));
      let (opened, merged) = futures::try_join!(
        self.search_count(base.clone()),
        self.search_count(format!("{} is:merged", base)),
      )?;
      Ok(PrCounts { opened, merged })
    }
    .boxed()
  }

  fn pull_requests<'a>(
    &'a self,
    owner: &'a str,
    repo: &'a str,
    since: DateTime<Utc>,
  ) -> BoxFuture<'a, Result<Vec<PullRequestSummary>>> {
    async move {
      let params = [
        ("state", "all".to_string()),
        ("sort", "created".to_string()),
        ("direction", "desc".to_string()),
      ];
      let prs: Vec<ApiPullRequest> = self
        .get_pages(
          &format!("/repos/{}/{}/pulls", owner, repo),
          &params,
          |page: &[ApiPullRequest]| page.last().map(|pr| pr.created_at >= since).unwrap_or(false),
        )
        .await?;
      Ok(
        prs
          .into_iter()
          .filter(|pr| pr.created_at >= since)
          .map(PullRequestSummary::from)
          .collect(),
      )
    }
    .boxed()
  }

  fn commits<'a>(
    &'a self,
    owner: &'a str,
    repo: &'a str,
    branch: &'a str,
    since: DateTime<Utc>,
  ) -> BoxFuture<'a, Result<Vec<CommitSummary>>> {
    async move {
      let params = [
        ("sha", branch.to_string()),
        ("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
      ];
      let commits: Vec<ApiCommit> = self
        .get_pages(
          &format!("/repos/{}/{}/commits", owner, repo),
          &params,
          |_| true,
        )
        .await?;
      Ok(commits.into_iter().map(CommitSummary::from).collect())
    }
    .boxed()
  }
}

impl AvatarSource for GitHubClient {
  fn avatar_url(&self, id: u64) -> BoxFuture<'_, Result<Option<String>>> {
    async move {
      let user: ApiUser = self.get_json(&format!("/user/{}", id), &[]).await?;
      Ok(user.avatar_url)
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_trailing_slash_trimmed() {
    let client = GitHubClient::new("https://ghe.example.com/api/v3/", Some("t")).unwrap();
    assert_eq!(client.base_url, "https://ghe.example.com/api/v3");
    assert!(client.rate_limit().is_none());
  }

  #[test]
  fn test_since_date_format() {
    let since = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    assert_eq!(since_date(since), "2023-11-14");
  }
}
