//! Install and activation phases.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore, RequestKey};
use crate::network::{FetchRequest, Fetcher};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  /// Constructed, no lifecycle event received yet
  Parsed,
  Installing,
  /// Installed; waiting for the previous version to let go
  Waiting,
  Activating,
  /// Active and controlling every open session
  Activated,
  /// Install failed; this version is discarded
  Redundant,
}

impl WorkerState {
  /// Only an activated worker sees fetch events
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Waiting => write!(f, "waiting"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Lifecycle state plus the skip-waiting and client-claim flags.
#[derive(Debug)]
pub struct Lifecycle {
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  controlling: AtomicBool,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
      controlling: AtomicBool::new(false),
    }
  }

  /// A version that was activated by an earlier run and still owns its shell store.
  pub fn resumed() -> Self {
    Self {
      state: Mutex::new(WorkerState::Activated),
      skip_waiting: AtomicBool::new(false),
      controlling: AtomicBool::new(true),
    }
  }

  pub fn state(&self) -> WorkerState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  pub fn set_state(&self, next: WorkerState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    let previous = *state;
    if previous != next {
      info!(from = %previous, to = %next, "lifecycle transition");
      *state = next;
    }
  }

  /// Ask to leave the waiting state as soon as possible.
  ///
  /// Returns true when a waiting version can act on it now; false (no-op)
  /// when nothing is waiting.
  pub fn skip_waiting(&self) -> bool {
    match self.state() {
      WorkerState::Installing | WorkerState::Waiting => {
        self.skip_waiting.store(true, Ordering::SeqCst);
        self.state() == WorkerState::Waiting
      }
      other => {
        debug!(state = %other, "skip waiting ignored, no update pending");
        false
      }
    }
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Take control of all open sessions without waiting for a navigation.
  pub fn claim(&self) {
    self.controlling.store(true, Ordering::SeqCst);
  }

  pub fn is_controlling(&self) -> bool {
    self.controlling.load(Ordering::SeqCst)
  }
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

/// Fetch every boot asset and seal them into the shell store.
///
/// All-or-nothing: if any fetch fails or returns a non-ok status nothing is
/// written.
pub async fn populate_shell<S, N>(
  shell: &CacheStore<S>,
  fetcher: &N,
  origin: &Url,
  assets: &[String],
) -> Result<usize>
where
  S: CacheStorage,
  N: Fetcher,
{
  shell.open()?;

  let fetches = assets.iter().map(|path| async move {
    let url = origin
      .join(path)
      .map_err(|e| eyre!("Invalid boot asset path {}: {}", path, e))?;
    let response = fetcher
      .fetch(FetchRequest::get(url.clone()))
      .await
      .map_err(|e| eyre!("Failed to fetch boot asset {}: {}", url, e))?;
    if !response.ok() {
      return Err(eyre!(
        "Boot asset {} returned status {}",
        url,
        response.status
      ));
    }
    Ok::<_, color_eyre::Report>((RequestKey::get(&url), response))
  });

  let entries = try_join_all(fetches).await?;
  shell.add_all(&entries)?;

  Ok(entries.len())
}

/// Delete every store except the ones named in `keep`.
///
/// Deletions run concurrently. A failed deletion is logged and left for the
/// next activation; listing the stores is the only hard failure.
pub async fn sweep_generations<S: CacheStorage>(
  storage: &Arc<S>,
  keep: &[&str],
) -> Result<Vec<String>> {
  let stale: Vec<String> = storage
    .keys()?
    .into_iter()
    .filter(|name| !keep.contains(&name.as_str()))
    .collect();

  let deletions = stale.iter().map(|name| {
    let storage = Arc::clone(storage);
    let name = name.clone();
    async move {
      let result = tokio::task::spawn_blocking({
        let name = name.clone();
        move || storage.delete(&name)
      })
      .await
      .map_err(|e| eyre!("Deletion task failed: {}", e))
      .and_then(|r| r);
      (name, result)
    }
  });

  let mut deleted = Vec::new();
  for (name, result) in join_all(deletions).await {
    match result {
      Ok(_) => {
        debug!(store = %name, "deleted stale cache store");
        deleted.push(name);
      }
      Err(e) => warn!(store = %name, error = %e, "failed to delete stale cache store"),
    }
  }

  Ok(deleted)
}
