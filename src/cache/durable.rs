//! Durable tier: a remote (or local) relational table keyed by cache key.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::{header, Client, StatusCode};
use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

use super::traits::{CacheEntry, EntrySource};
use crate::error::{CacheError, Result, Tier};

/// One row of a durable cache table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
  pub cache_key: String,
  pub value: serde_json::Value,
  pub cached_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl DurableRecord {
  pub fn from_entry<V: Serialize>(entry: &CacheEntry<V>) -> Result<Self> {
    Ok(Self {
      cache_key: entry.key().to_string(),
      value: serde_json::to_value(entry.value())?,
      cached_at: entry.cached_at(),
      expires_at: entry.expires_at(),
    })
  }

  /// Decode the row into an entry labelled as coming from the durable tier.
  pub fn into_entry<V: DeserializeOwned>(self) -> Result<CacheEntry<V>> {
    let value: V = serde_json::from_value(self.value)?;
    CacheEntry::from_parts(
      self.cache_key,
      value,
      self.cached_at,
      self.expires_at,
      EntrySource::Durable,
    )
  }
}

/// Row filter for durable queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
  /// Point lookup.
  KeyEquals(String),
  /// Batched lookup with `IN` semantics.
  KeyIn(Vec<String>),
}

impl KeyFilter {
  pub fn keys(&self) -> Vec<&str> {
    match self {
      KeyFilter::KeyEquals(key) => vec![key.as_str()],
      KeyFilter::KeyIn(keys) => keys.iter().map(String::as_str).collect(),
    }
  }
}

/// Rows the store rejected during an upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
  pub errors: Vec<String>,
}

impl UpsertOutcome {
  pub fn is_ok(&self) -> bool {
    self.errors.is_empty()
  }
}

/// Trait for durable storage backends.
///
/// Upserts must be idempotent under `cache_key`. Either call may fail
/// transiently; callers treat failures as a missing tier.
pub trait DurableStore: Send + Sync {
  /// Backend name for logs.
  fn name(&self) -> &'static str;

  fn query(&self, filter: KeyFilter) -> BoxFuture<'_, Result<Vec<DurableRecord>>>;

  fn upsert(&self, records: Vec<DurableRecord>) -> BoxFuture<'_, Result<UpsertOutcome>>;

  /// Hand records off without waiting for the outcome.
  ///
  /// Used on teardown when no async continuation is guaranteed to run.
  /// Returns false if the backend has no such transport.
  fn send_beacon(&self, _records: Vec<DurableRecord>) -> bool {
    false
  }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> CacheError {
  CacheError::tier(Tier::Durable, format!("{}: {}", context, err))
}

/// Table names are interpolated into SQL and URLs, so restrict them.
fn check_table_name(table: &str) -> Result<()> {
  let valid = !table.is_empty()
    && table
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(CacheError::validation(format!("invalid table name {:?}", table)))
  }
}

// ============================================================================
// SQLite
// ============================================================================

/// Durable store backed by a local SQLite table.
#[derive(Clone)]
pub struct SqliteDurableStore {
  conn: Arc<Mutex<Connection>>,
  table: String,
}

impl SqliteDurableStore {
  pub fn open_at(path: &Path, table: &str) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| unavailable("Failed to create database directory", e))?;
    }
    let conn = Connection::open(path).map_err(|e| {
      unavailable(
        &format!("Failed to open database at {}", path.display()),
        e,
      )
    })?;
    Self::with_connection(conn, table)
  }

  pub fn open_in_memory(table: &str) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| unavailable("Failed to open database", e))?;
    Self::with_connection(conn, table)
  }

  fn with_connection(conn: Connection, table: &str) -> Result<Self> {
    check_table_name(table)?;
    conn
      .execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            cache_key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            cached_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );"
      ))
      .map_err(|e| unavailable("Failed to run migrations", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      table: table.to_string(),
    })
  }

  fn query_sync(&self, filter: &KeyFilter) -> Result<Vec<DurableRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| unavailable("Lock poisoned", e))?;
    let keys = filter.keys();
    if keys.is_empty() {
      return Ok(Vec::new());
    }

    let placeholders = vec!["?"; keys.len()].join(", ");
    let mut stmt = conn
      .prepare(&format!(
        "SELECT cache_key, value, cached_at, expires_at FROM {}
         WHERE cache_key IN ({})",
        self.table, placeholders
      ))
      .map_err(|e| unavailable("Failed to prepare query", e))?;

    let rows: Vec<(String, String, String, String)> = stmt
      .query_map(rusqlite::params_from_iter(keys.iter()), |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| unavailable("Failed to query records", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| unavailable("Failed to read record", e))?;

    let mut records = Vec::with_capacity(rows.len());
    for (cache_key, value, cached_at, expires_at) in rows {
      // A corrupt row is skipped rather than failing the whole batch.
      match decode_row(cache_key, &value, &cached_at, &expires_at) {
        Ok(record) => records.push(record),
        Err(e) => tracing::warn!(error = %e, "Skipping malformed durable row"),
      }
    }
    Ok(records)
  }

  fn upsert_sync(&self, records: &[DurableRecord]) -> Result<UpsertOutcome> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| unavailable("Lock poisoned", e))?;
    let tx = conn
      .transaction()
      .map_err(|e| unavailable("Failed to begin transaction", e))?;

    let mut outcome = UpsertOutcome::default();
    {
      let mut stmt = tx
        .prepare(&format!(
          "INSERT INTO {} (cache_key, value, cached_at, expires_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(cache_key) DO UPDATE SET
             value = excluded.value,
             cached_at = excluded.cached_at,
             expires_at = excluded.expires_at",
          self.table
        ))
        .map_err(|e| unavailable("Failed to prepare upsert", e))?;

      for record in records {
        let result = stmt.execute(params![
          record.cache_key,
          record.value.to_string(),
          record.cached_at.to_rfc3339(),
          record.expires_at.to_rfc3339(),
        ]);
        if let Err(e) = result {
          outcome.errors.push(format!("{}: {}", record.cache_key, e));
        }
      }
    }

    tx.commit()
      .map_err(|e| unavailable("Failed to commit transaction", e))?;
    Ok(outcome)
  }
}

fn decode_row(
  cache_key: String,
  value: &str,
  cached_at: &str,
  expires_at: &str,
) -> Result<DurableRecord> {
  let parse = |s: &str| {
    DateTime::parse_from_rfc3339(s)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| CacheError::validation(format!("bad timestamp '{}': {}", s, e)))
  };
  Ok(DurableRecord {
    value: serde_json::from_str(value)?,
    cached_at: parse(cached_at)?,
    expires_at: parse(expires_at)?,
    cache_key,
  })
}

impl DurableStore for SqliteDurableStore {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn query(&self, filter: KeyFilter) -> BoxFuture<'_, Result<Vec<DurableRecord>>> {
    Box::pin(async move { self.query_sync(&filter) })
  }

  fn upsert(&self, records: Vec<DurableRecord>) -> BoxFuture<'_, Result<UpsertOutcome>> {
    Box::pin(async move { self.upsert_sync(&records) })
  }

  fn send_beacon(&self, records: Vec<DurableRecord>) -> bool {
    // Local writes are synchronous anyway.
    match self.upsert_sync(&records) {
      Ok(outcome) => outcome.is_ok(),
      Err(e) => {
        tracing::warn!(error = %e, "Beacon upsert failed");
        false
      }
    }
  }
}

// ============================================================================
// PostgREST (Supabase)
// ============================================================================

/// Normalize to the REST endpoint with a trailing slash, so table names join
/// below it.
fn rest_endpoint(raw: &str) -> Result<Url> {
  let trimmed = raw.trim_end_matches('/');
  let endpoint = if trimmed.ends_with("/rest/v1") {
    format!("{}/", trimmed)
  } else {
    format!("{}/rest/v1/", trimmed)
  };
  Url::parse(&endpoint).map_err(|e| unavailable("Invalid durable store URL", e))
}

/// Durable store speaking the PostgREST protocol, as exposed by Supabase.
#[derive(Clone)]
pub struct PostgrestStore {
  client: Client,
  base_url: Url,
  table: String,
}

const SELECT_COLUMNS: &str = "cache_key,value,cached_at,expires_at";

impl PostgrestStore {
  /// Create a store for `table`.
  ///
  /// `base_url` is the REST endpoint (`https://xyz.supabase.co/rest/v1`); a
  /// bare project URL gets `/rest/v1` appended.
  pub fn new(base_url: &str, api_key: &str, table: &str) -> Result<Self> {
    check_table_name(table)?;
    let base_url = rest_endpoint(base_url)?;

    let mut headers = header::HeaderMap::new();
    let key = header::HeaderValue::from_str(api_key)
      .map_err(|e| unavailable("Invalid API key", e))?;
    let bearer = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| unavailable("Invalid API key", e))?;
    headers.insert("apikey", key);
    headers.insert(header::AUTHORIZATION, bearer);

    let client = Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| unavailable("Failed to build HTTP client", e))?;

    Ok(Self {
      client,
      base_url,
      table: table.to_string(),
    })
  }

  fn table_url(&self) -> Result<Url> {
    self
      .base_url
      .join(&self.table)
      .map_err(|e| unavailable("Invalid table URL", e))
  }

  /// URL for a filtered select.
  pub fn query_url(&self, filter: &KeyFilter) -> Result<Url> {
    let mut url = self.table_url()?;
    let condition = match filter {
      KeyFilter::KeyEquals(key) => format!("eq.{}", key),
      KeyFilter::KeyIn(keys) => {
        let quoted: Vec<String> = keys.iter().map(|k| quote_in_value(k)).collect();
        format!("in.({})", quoted.join(","))
      }
    };
    url
      .query_pairs_mut()
      .append_pair("select", SELECT_COLUMNS)
      .append_pair("cache_key", &condition);
    Ok(url)
  }

  async fn post_records(&self, records: &[DurableRecord]) -> Result<UpsertOutcome> {
    let mut url = self.table_url()?;
    url.query_pairs_mut().append_pair("on_conflict", "cache_key");

    let response = self
      .client
      .post(url)
      .header("Prefer", "resolution=merge-duplicates,return=minimal")
      .json(records)
      .send()
      .await
      .map_err(|e| unavailable("Upsert request failed", e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(UpsertOutcome::default());
    }
    let body = response.text().await.unwrap_or_default();
    Ok(UpsertOutcome {
      errors: vec![format!("{}: {}", status, body)],
    })
  }
}

/// Quote a value for a PostgREST `in.(...)` list.
fn quote_in_value(value: &str) -> String {
  format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl DurableStore for PostgrestStore {
  fn name(&self) -> &'static str {
    "postgrest"
  }

  fn query(&self, filter: KeyFilter) -> BoxFuture<'_, Result<Vec<DurableRecord>>> {
    Box::pin(async move {
      if filter.keys().is_empty() {
        return Ok(Vec::new());
      }
      let url = self.query_url(&filter)?;
      let response = self
        .client
        .get(url)
        .send()
        .await
        .map_err(|e| unavailable("Query request failed", e))?;

      match response.status() {
        StatusCode::OK => response
          .json::<Vec<DurableRecord>>()
          .await
          .map_err(|e| unavailable("Failed to decode rows", e)),
        status => {
          let body = response.text().await.unwrap_or_default();
          Err(unavailable(&format!("Query returned {}", status), body))
        }
      }
    })
  }

  fn upsert(&self, records: Vec<DurableRecord>) -> BoxFuture<'_, Result<UpsertOutcome>> {
    Box::pin(async move { self.post_records(&records).await })
  }

  fn send_beacon(&self, records: Vec<DurableRecord>) -> bool {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return false;
    };
    let store = self.clone();
    handle.spawn(async move {
      if let Err(e) = store.post_records(&records).await {
        tracing::debug!(error = %e, "Beacon upsert failed");
      }
    });
    true
  }
}
