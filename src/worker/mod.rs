//! The offline cache controller.
//!
//! Intercepts the app's network requests and answers them from the shell
//! store, the runtime store, or the network:
//! - install seals the boot assets into a version-stamped shell store
//! - activate sweeps stale store generations and claims open sessions
//! - fetch classifies each request and runs the matching strategy
//! - message handles the `SKIP_WAITING` control payload

mod classify;
mod lifecycle;
mod normalize;
mod race;
mod strategy;

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CacheStore, RequestKey};
use crate::config::Config;
use crate::network::{FetchRequest, Fetcher};

use classify::{RequestClassifier, Strategy};
use lifecycle::Lifecycle;
use normalize::UrlNormalizer;
use strategy::StrategyExecutor;

pub use lifecycle::WorkerState;
pub use strategy::FetchOutcome;

/// One method per host lifecycle event.
///
/// `install` and `activate` resolve when their work is complete so the host
/// knows when to move on.
pub trait ServiceWorker: Send + Sync {
  fn state(&self) -> WorkerState;

  fn install(&self) -> impl Future<Output = Result<()>> + Send;

  fn activate(&self) -> impl Future<Output = Result<()>> + Send;

  fn fetch(&self, request: FetchRequest) -> impl Future<Output = FetchOutcome> + Send;

  /// Handle a control message. Returns true when the host should activate
  /// the waiting version now.
  fn message(&self, data: &Value) -> bool;

  /// Installed and asked to skip waiting
  fn ready_to_activate(&self) -> bool;

  /// Resolve once all detached background work has finished.
  fn settle(&self) -> impl Future<Output = ()> + Send;
}

/// Control messages understood by the controller
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
}

/// Static inputs of the controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
  pub origin: Url,
  pub boot_assets: Vec<String>,
  pub entry_document: String,
  pub whitelist: BTreeSet<String>,
  pub asset_prefix: String,
}

impl ControllerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      origin: config.origin_url()?,
      boot_assets: config.shell.assets.clone(),
      entry_document: config.shell.entry_document.clone(),
      whitelist: config.whitelist.clone(),
      asset_prefix: config.asset_prefix.clone(),
    })
  }
}

/// Offline cache controller over injected shell and runtime stores.
pub struct CacheController<S: CacheStorage, N: Fetcher> {
  settings: ControllerSettings,
  lifecycle: Lifecycle,
  classifier: RequestClassifier,
  executor: StrategyExecutor<S, N>,
  shell: CacheStore<S>,
  runtime: CacheStore<S>,
  fetcher: Arc<N>,
}

impl<S: CacheStorage, N: Fetcher> CacheController<S, N> {
  /// Both stores must live in the same storage backend.
  pub fn new(
    settings: ControllerSettings,
    shell: CacheStore<S>,
    runtime: CacheStore<S>,
    fetcher: Arc<N>,
  ) -> Result<Self> {
    let entry_url = settings.origin.join(&settings.entry_document).map_err(|e| {
      eyre!("Invalid entry document {}: {}", settings.entry_document, e)
    })?;

    let classifier = RequestClassifier::new(&settings.origin, settings.whitelist.iter().cloned());
    let normalizer = UrlNormalizer::new(settings.origin.clone(), settings.asset_prefix.clone());
    let executor = StrategyExecutor::new(
      shell.clone(),
      runtime.clone(),
      Arc::clone(&fetcher),
      normalizer,
      RequestKey::get(&entry_url),
    );

    let lifecycle = if Self::was_activated(&shell) {
      debug!(store = shell.name(), "resuming activated version");
      Lifecycle::resumed()
    } else {
      Lifecycle::new()
    };

    Ok(Self {
      settings,
      lifecycle,
      classifier,
      executor,
      shell,
      runtime,
      fetcher,
    })
  }

  /// Whether an earlier run activated this shell version and its store is still there.
  fn was_activated(shell: &CacheStore<S>) -> bool {
    let active = match shell.storage().active_version() {
      Ok(active) => active,
      Err(e) => {
        warn!(error = %e, "could not read registration, starting fresh");
        return false;
      }
    };
    active.as_deref() == Some(shell.name()) && shell.exists().unwrap_or(false)
  }

  pub fn lifecycle(&self) -> &Lifecycle {
    &self.lifecycle
  }

  pub fn shell(&self) -> &CacheStore<S> {
    &self.shell
  }

  pub fn runtime(&self) -> &CacheStore<S> {
    &self.runtime
  }
}

impl<S: CacheStorage, N: Fetcher> ServiceWorker for CacheController<S, N> {
  fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  async fn install(&self) -> Result<()> {
    self.lifecycle.set_state(WorkerState::Installing);
    // Activate as soon as the shell is sealed instead of waiting for old sessions
    self.lifecycle.skip_waiting();

    let populated = lifecycle::populate_shell(
      &self.shell,
      self.fetcher.as_ref(),
      &self.settings.origin,
      &self.settings.boot_assets,
    )
    .await;

    match populated {
      Ok(count) => {
        info!(store = self.shell.name(), assets = count, "shell cache populated");
        self.lifecycle.set_state(WorkerState::Waiting);
        Ok(())
      }
      Err(e) => {
        self.lifecycle.set_state(WorkerState::Redundant);
        Err(e.wrap_err(format!("Install of {} failed", self.shell.name())))
      }
    }
  }

  async fn activate(&self) -> Result<()> {
    // Only an installed version may sweep its predecessors
    match self.lifecycle.state() {
      WorkerState::Waiting => {}
      WorkerState::Activated => {
        debug!(store = self.shell.name(), "already activated");
        return Ok(());
      }
      state => {
        return Err(eyre!(
          "Cannot activate {} from state {}; install it first",
          self.shell.name(),
          state
        ))
      }
    }

    self.lifecycle.set_state(WorkerState::Activating);

    let keep = [self.shell.name(), self.runtime.name()];
    match lifecycle::sweep_generations(self.shell.storage(), &keep).await {
      Ok(deleted) if deleted.is_empty() => debug!("no stale cache generations"),
      Ok(deleted) => info!(deleted = ?deleted, "stale cache generations removed"),
      Err(e) => warn!(error = %e, "cache generation sweep failed"),
    }

    self.lifecycle.claim();
    if let Err(e) = self.shell.storage().set_active_version(self.shell.name()) {
      warn!(error = %e, "could not record active version");
    }
    self.lifecycle.set_state(WorkerState::Activated);

    Ok(())
  }

  async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
    let strategy = self.classifier.classify(&request);
    debug!(method = %request.method, url = %request.url, ?strategy, "intercepted");

    match strategy {
      Strategy::Passthrough => FetchOutcome::Unhandled,
      Strategy::Navigation => self.executor.navigate(request).await,
      Strategy::Revalidate => self.executor.revalidate(request).await,
    }
  }

  fn message(&self, data: &Value) -> bool {
    match ControlMessage::deserialize(data) {
      Ok(ControlMessage::SkipWaiting) => self.lifecycle.skip_waiting(),
      Err(_) => {
        debug!(message = %data, "ignoring unknown control message");
        false
      }
    }
  }

  fn ready_to_activate(&self) -> bool {
    self.lifecycle.state() == WorkerState::Waiting && self.lifecycle.skip_waiting_requested()
  }

  async fn settle(&self) {
    self.executor.flush_background().await;
  }
}
