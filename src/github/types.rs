//! GitHub REST API response types and the summaries derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UserType {
  #[default]
  User,
  Organization,
  Bot,
  #[serde(other)]
  Unknown,
}

/// GitHub user, organization or app account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
  pub id: u64,
  pub login: String,
  #[serde(rename = "type", default)]
  pub user_type: UserType,
  pub avatar_url: Option<String>,
}

impl ApiUser {
  pub fn is_bot(&self) -> bool {
    is_bot(&self.login, self.user_type)
  }
}

/// Bot accounts either carry the `Bot` type or a `[bot]` login suffix.
pub fn is_bot(login: &str, user_type: UserType) -> bool {
  user_type == UserType::Bot || login.ends_with("[bot]")
}

/// GitHub repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRepository {
  pub id: u64,
  pub full_name: String,
  pub default_branch: String,
  #[serde(default)]
  pub stargazers_count: u64,
  #[serde(default)]
  pub forks_count: u64,
}

/// Result envelope of the search API; only the count is used.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSearchCount {
  pub total_count: u64,
}

/// Pull request as returned by the list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiPullRequest {
  pub number: u64,
  pub user: Option<ApiUser>,
  pub created_at: DateTime<Utc>,
  pub merged_at: Option<DateTime<Utc>>,
  pub merge_commit_sha: Option<String>,
}

/// Commit as returned by the list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiCommit {
  pub sha: String,
  pub author: Option<ApiUser>,
  pub commit: ApiCommitDetail,
  #[serde(default)]
  pub parents: Vec<ApiCommitRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCommitDetail {
  pub author: Option<ApiGitAuthor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiGitAuthor {
  pub name: String,
  pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCommitRef {
  pub sha: String,
}

/// Repository identity needed by the first stats stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
  pub id: u64,
  pub default_branch: String,
}

impl From<ApiRepository> for RepoSummary {
  fn from(repo: ApiRepository) -> Self {
    Self {
      id: repo.id,
      default_branch: repo.default_branch,
    }
  }
}

/// Pull request counts in a time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrCounts {
  pub opened: u64,
  pub merged: u64,
}

/// Pull request reduced to what the stats need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSummary {
  pub number: u64,
  pub author: String,
  #[serde(default)]
  pub author_is_bot: bool,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub merged: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub merge_commit_sha: Option<String>,
}

impl From<ApiPullRequest> for PullRequestSummary {
  fn from(pr: ApiPullRequest) -> Self {
    let (author, author_is_bot) = match &pr.user {
      Some(user) => (user.login.clone(), user.is_bot()),
      None => ("ghost".to_string(), false),
    };
    Self {
      number: pr.number,
      author,
      author_is_bot,
      created_at: pr.created_at,
      merged: pr.merged_at.is_some(),
      merge_commit_sha: pr.merge_commit_sha,
    }
  }
}

/// Commit reduced to what the direct-commit analysis needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
  pub sha: String,
  /// GitHub login when the commit is linked to an account, else the git name.
  pub author: String,
  pub author_is_bot: bool,
  pub is_merge: bool,
}

impl From<ApiCommit> for CommitSummary {
  fn from(commit: ApiCommit) -> Self {
    let (author, author_is_bot) = match (&commit.author, &commit.commit.author) {
      (Some(user), _) => (user.login.clone(), user.is_bot()),
      (None, Some(git)) => (git.name.clone(), false),
      (None, None) => ("unknown".to_string(), false),
    };
    Self {
      sha: commit.sha,
      author,
      author_is_bot,
      is_merge: commit.parents.len() > 1,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bot_detection() {
    assert!(is_bot("dependabot[bot]", UserType::User));
    assert!(is_bot("renovate", UserType::Bot));
    assert!(!is_bot("torvalds", UserType::User));
  }

  #[test]
  fn test_pull_request_summary_from_api() {
    let pr: ApiPullRequest = serde_json::from_str(
      r#"{
        "number": 12,
        "user": {"id": 1, "login": "octocat", "type": "User", "avatar_url": null},
        "created_at": "2024-05-01T10:00:00Z",
        "merged_at": "2024-05-02T10:00:00Z",
        "merge_commit_sha": "abc123"
      }"#,
    )
    .unwrap();
    let summary = PullRequestSummary::from(pr);
    assert_eq!(summary.author, "octocat");
    assert!(summary.merged);
    assert_eq!(summary.merge_commit_sha.as_deref(), Some("abc123"));
  }

  #[test]
  fn test_unknown_user_type_tolerated() {
    let user: ApiUser =
      serde_json::from_str(r#"{"id": 3, "login": "x", "type": "Mannequin"}"#).unwrap();
    assert_eq!(user.user_type, UserType::Unknown);
    assert!(user.avatar_url.is_none());
  }
}
