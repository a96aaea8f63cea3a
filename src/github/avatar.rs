//! Contributor avatar URLs keyed by GitHub account id.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::{CacheKey, Cacheable, OriginFetcher, Stage};
use crate::error::{CacheError, Result};

const AVATAR_HOST: &str = "avatars.githubusercontent.com";

/// Looks up the avatar of an account.
pub trait AvatarSource: Send + Sync + 'static {
  fn avatar_url(&self, id: u64) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Avatar lookup. The cache identity is the account id alone; `fallback` is a
/// URL the caller already knows (e.g. from a pull request payload) and is
/// used instead of asking GitHub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarKey {
  pub id: u64,
  pub fallback: Option<String>,
}

impl AvatarKey {
  pub fn new(id: u64) -> Self {
    Self { id, fallback: None }
  }

  pub fn with_fallback(id: u64, fallback: impl Into<String>) -> Self {
    Self {
      id,
      fallback: Some(fallback.into()),
    }
  }
}

impl CacheKey for AvatarKey {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn description(&self) -> String {
    format!("avatar of account {}", self.id)
  }
}

/// A validated avatar URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvatarUrl(pub String);

impl AvatarUrl {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for AvatarUrl {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl Cacheable for AvatarUrl {
  fn entity_type() -> &'static str {
    "avatar"
  }
}

/// The avatar GitHub serves for any account id.
pub fn default_avatar_url(id: u64) -> AvatarUrl {
  AvatarUrl(format!("https://{}/u/{}", AVATAR_HOST, id))
}

/// Only https URLs on GitHub's own hosts are accepted.
pub fn check_avatar_url(raw: &str) -> Result<()> {
  let url = Url::parse(raw).map_err(|e| CacheError::validation(format!("{raw:?}: {e}")))?;
  if url.scheme() != "https" {
    return Err(CacheError::validation(format!(
      "{raw:?}: scheme {} is not allowed",
      url.scheme()
    )));
  }
  if !url.username().is_empty() || url.password().is_some() {
    return Err(CacheError::validation(format!("{raw:?}: credentials are not allowed")));
  }
  let host = url.host_str().unwrap_or_default();
  let trusted = host == AVATAR_HOST
    || host == "github.com"
    || host.ends_with(".githubusercontent.com");
  if !trusted {
    return Err(CacheError::validation(format!("{raw:?}: host {host} is not trusted")));
  }
  Ok(())
}

/// Origin for [`AvatarUrl`]. Single stage.
pub struct AvatarFetcher<S: AvatarSource> {
  source: S,
}

impl<S: AvatarSource> AvatarFetcher<S> {
  pub fn new(source: S) -> Self {
    Self { source }
  }
}

impl<S: AvatarSource> OriginFetcher<AvatarKey> for AvatarFetcher<S> {
  type Value = AvatarUrl;

  fn fetch_stage<'a>(
    &'a self,
    key: &'a AvatarKey,
    _stage: Stage,
    _prior: Option<&'a AvatarUrl>,
  ) -> BoxFuture<'a, Result<AvatarUrl>> {
    async move {
      if let Some(fallback) = &key.fallback {
        return Ok(AvatarUrl(fallback.clone()));
      }
      let url = self.source.avatar_url(key.id).await?;
      Ok(url.map(AvatarUrl).unwrap_or_else(|| default_avatar_url(key.id)))
    }
    .boxed()
  }

  fn validate(&self, _key: &AvatarKey, value: AvatarUrl) -> Result<AvatarUrl> {
    check_avatar_url(value.as_str())?;
    Ok(value)
  }

  fn default_value(&self, key: &AvatarKey) -> Option<AvatarUrl> {
    Some(default_avatar_url(key.id))
  }
}
