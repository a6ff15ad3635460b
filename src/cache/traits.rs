//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::network::{FetchRequest, FetchResponse};

/// Identity of a cache entry: request method plus the original, un-normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn get(url: &url::Url) -> Self {
    Self::new("GET", url.as_str())
  }

  /// Stable, fixed-length storage key
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

impl From<&FetchRequest> for RequestKey {
  fn from(request: &FetchRequest) -> Self {
    Self::new(&request.method, request.url.as_str())
  }
}

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: FetchResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a delivered response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Entry from a cache store won the revalidate race or covered a network failure
  Cache,
  /// Network unavailable during navigation, serving the cached entry document
  ShellFallback,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores (the generation set). Every
/// operation is addressed by store name; writing to a name that does not
/// exist yet creates it.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named store if it does not exist.
  fn open(&self, name: &str) -> Result<()>;

  fn has(&self, name: &str) -> Result<bool>;

  /// All store names, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look a request up in one store.
  fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Look a request up in every store, oldest store first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a single response, replacing any entry under the same key.
  fn put(&self, name: &str, key: &RequestKey, response: &FetchResponse) -> Result<()>;

  /// Store a batch of responses atomically: all of them or none.
  fn put_all(&self, name: &str, entries: &[(RequestKey, FetchResponse)]) -> Result<()>;

  /// Keys of every entry in a store.
  fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>>;

  /// Shell store name of the last activated version.
  fn active_version(&self) -> Result<Option<String>>;

  fn set_active_version(&self, name: &str) -> Result<()>;
}
