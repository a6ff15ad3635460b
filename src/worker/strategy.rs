//! Navigation and stale-while-revalidate handling.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, CacheStore, RequestKey, ResponseSource};
use crate::network::{FetchRequest, FetchResponse, Fetcher};

use super::normalize::UrlNormalizer;
use super::race::race_with_fallback;

/// What the controller did with an intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Not intercepted; the host performs its default fetch
  Unhandled,
  Responded {
    response: FetchResponse,
    source: ResponseSource,
  },
  /// Intercepted, but neither network nor cache produced a response
  NoResponse,
}

impl FetchOutcome {
  fn respond(response: FetchResponse, source: ResponseSource) -> Self {
    Self::Responded { response, source }
  }
}

/// Runs the navigation and revalidate strategies against the injected stores.
pub struct StrategyExecutor<S: CacheStorage, N: Fetcher> {
  shell: CacheStore<S>,
  runtime: CacheStore<S>,
  fetcher: Arc<N>,
  normalizer: UrlNormalizer,
  entry_key: RequestKey,
  /// Detached runtime-store writes, kept so the host can wait for them
  background: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage, N: Fetcher> StrategyExecutor<S, N> {
  pub fn new(
    shell: CacheStore<S>,
    runtime: CacheStore<S>,
    fetcher: Arc<N>,
    normalizer: UrlNormalizer,
    entry_key: RequestKey,
  ) -> Self {
    Self {
      shell,
      runtime,
      fetcher,
      normalizer,
      entry_key,
      background: Mutex::new(JoinSet::new()),
    }
  }

  /// Fresh network first; the sealed entry document when the network is unreachable.
  ///
  /// Any HTTP response, error statuses included, is returned as is. Nothing is
  /// written back.
  pub async fn navigate(&self, request: FetchRequest) -> FetchOutcome {
    let error = match self.fetcher.fetch(request.no_store()).await {
      Ok(response) => return FetchOutcome::respond(response, ResponseSource::Network),
      Err(e) => e,
    };

    debug!(url = %request.url, error = %error, "navigation offline, falling back to shell");
    match self.shell.match_request(&self.entry_key) {
      Ok(Some(cached)) => {
        debug!(cached_at = %cached.cached_at, "serving sealed entry document");
        FetchOutcome::respond(cached.response, ResponseSource::ShellFallback)
      }
      Ok(None) => {
        warn!(
          store = self.shell.name(),
          entry = %self.entry_key,
          "shell store has no entry document, navigation gets no response"
        );
        FetchOutcome::NoResponse
      }
      Err(e) => {
        warn!(store = self.shell.name(), error = %e, "shell store lookup failed");
        FetchOutcome::NoResponse
      }
    }
  }

  /// Race every store against a cache-busted network fetch.
  ///
  /// The network response, once it arrives, is written to the runtime store
  /// under the original request key when its status is ok. That write runs
  /// in the background and never delays the response.
  pub async fn revalidate(&self, request: FetchRequest) -> FetchOutcome {
    let key = RequestKey::from(&request);
    let outbound = request
      .with_url(self.normalizer.normalize(&request.url, Utc::now()))
      .no_store();

    let (tx, rx) = oneshot::channel();
    self.spawn_background(refresh_runtime(
      Arc::clone(&self.fetcher),
      self.runtime.clone(),
      key.clone(),
      outbound,
      tx,
    ));

    let storage = Arc::clone(self.runtime.storage());
    let cache = async move {
      storage
        .match_any(&key)
        .map(|hit| hit.map(|cached| (cached.response, ResponseSource::Cache)))
    };
    let network = async move {
      rx.await
        .map_err(|_| eyre!("Network fetch task ended without a result"))
        .and_then(|result| result)
        .map(|response| (response, ResponseSource::Network))
    };

    match race_with_fallback(cache, network).await {
      Some((response, source)) => FetchOutcome::respond(response, source),
      None => {
        debug!(url = %request.url, "revalidate produced no response");
        FetchOutcome::NoResponse
      }
    }
  }

  fn spawn_background<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.background.lock() {
      Ok(mut tasks) => {
        // Reap finished writes so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every background write started so far.
  pub async fn flush_background(&self) {
    let mut tasks = match self.background.lock() {
      Ok(mut tasks) => std::mem::take(&mut *tasks),
      Err(_) => return,
    };
    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "background cache write panicked");
      }
    }
  }
}

/// Fetch `outbound`, hand the result to the waiting race, then store ok
/// responses in the runtime store under `key`.
async fn refresh_runtime<S: CacheStorage, N: Fetcher>(
  fetcher: Arc<N>,
  runtime: CacheStore<S>,
  key: RequestKey,
  outbound: FetchRequest,
  tx: oneshot::Sender<Result<FetchResponse>>,
) {
  let response = match fetcher.fetch(outbound).await {
    Ok(response) => response,
    Err(e) => {
      debug!(key = %key, error = %e, "revalidate fetch failed");
      let _ = tx.send(Err(e));
      return;
    }
  };

  // The race may already be settled from cache; a closed receiver is fine
  let _ = tx.send(Ok(response.clone()));

  if !response.ok() {
    debug!(key = %key, status = response.status, "not caching non-ok response");
    return;
  }
  if let Err(e) = runtime.put(&key, &response) {
    warn!(store = runtime.name(), key = %key, error = %e, "runtime cache write failed");
  }
}
