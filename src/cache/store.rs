//! Handle to one named cache store.

use color_eyre::Result;
use std::sync::Arc;

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::network::FetchResponse;

/// A named store inside a shared [`CacheStorage`].
///
/// The controller receives its shell and runtime stores as two of these,
/// so tests can hand it in-memory backends.
pub struct CacheStore<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: Arc<S>, name: impl Into<String>) -> Self {
    Self {
      storage,
      name: name.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// The backend holding this store and its siblings.
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn open(&self) -> Result<()> {
    self.storage.open(&self.name)
  }

  pub fn exists(&self) -> Result<bool> {
    self.storage.has(&self.name)
  }

  pub fn match_request(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.storage.match_in(&self.name, key)
  }

  pub fn put(&self, key: &RequestKey, response: &FetchResponse) -> Result<()> {
    self.storage.put(&self.name, key, response)
  }

  /// Write every entry or none of them.
  pub fn add_all(&self, entries: &[(RequestKey, FetchResponse)]) -> Result<()> {
    self.storage.put_all(&self.name, entries)
  }

  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    self.storage.entry_keys(&self.name)
  }
}

impl<S: CacheStorage> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}
