//! Host adapter: turns host events into calls on a [`ServiceWorker`].

use color_eyre::{eyre::eyre, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::ResponseSource;
use crate::network::{FetchRequest, FetchResponse, Fetcher, RequestMode};
use crate::worker::{FetchOutcome, ServiceWorker, WorkerState};

/// Events delivered by the host environment
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum HostEvent {
  Install,
  Activate,
  /// One intercepted network request
  Fetch {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    mode: RequestMode,
  },
  /// Control channel payload
  Message { data: Value },
}

fn default_method() -> String {
  "GET".to_string()
}

/// Result of dispatching one host event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum HostReply {
  Lifecycle {
    state: WorkerState,
  },
  Response {
    url: String,
    status: u16,
    source: ResponseSource,
    /// Whether the controller answered, as opposed to default network handling
    intercepted: bool,
    content_type: Option<String>,
    bytes: usize,
    #[serde(skip)]
    body: Vec<u8>,
  },
  /// The request failed: nothing answered it
  NoResponse {
    url: String,
    reason: String,
  },
  Error {
    message: String,
  },
}

impl HostReply {
  fn response(response: FetchResponse, source: ResponseSource, intercepted: bool) -> Self {
    Self::Response {
      content_type: response.header("content-type").map(String::from),
      url: response.url,
      status: response.status,
      source,
      intercepted,
      bytes: response.body.len(),
      body: response.body,
    }
  }

  fn error(report: &color_eyre::Report) -> Self {
    Self::Error {
      message: report
        .chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": "),
    }
  }
}

/// Drives a worker the way a browser would: lifecycle transitions, fetch
/// routing, and default network behaviour for requests the worker leaves alone.
pub struct WorkerHost<W: ServiceWorker, N: Fetcher> {
  worker: W,
  network: Arc<N>,
}

impl<W: ServiceWorker, N: Fetcher> WorkerHost<W, N> {
  pub fn new(worker: W, network: Arc<N>) -> Self {
    Self { worker, network }
  }

  pub fn worker(&self) -> &W {
    &self.worker
  }

  pub async fn dispatch(&self, event: HostEvent) -> Result<HostReply> {
    match event {
      HostEvent::Install => {
        self.worker.install().await?;
        self.activate_if_ready().await?;
        Ok(self.lifecycle_reply())
      }
      HostEvent::Activate => {
        self.worker.activate().await?;
        Ok(self.lifecycle_reply())
      }
      HostEvent::Fetch { url, method, mode } => {
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
        let request = FetchRequest::get(url).with_method(&method).with_mode(mode);
        Ok(self.fetch(request).await)
      }
      HostEvent::Message { data } => {
        if self.worker.message(&data) {
          self.activate_if_ready().await?;
        }
        Ok(self.lifecycle_reply())
      }
    }
  }

  /// Route a request through the worker when it controls the page, otherwise
  /// straight to the network.
  pub async fn fetch(&self, request: FetchRequest) -> HostReply {
    let url = request.url.to_string();
    let outcome = if self.worker.state().can_intercept_fetch() {
      self.worker.fetch(request.clone()).await
    } else {
      debug!(state = %self.worker.state(), url = %url, "worker not active, not intercepting");
      FetchOutcome::Unhandled
    };

    match outcome {
      FetchOutcome::Responded { response, source } => HostReply::response(response, source, true),
      FetchOutcome::NoResponse => HostReply::NoResponse {
        url,
        reason: "no cached or network response".to_string(),
      },
      FetchOutcome::Unhandled => match self.network.fetch(request).await {
        Ok(response) => HostReply::response(response, ResponseSource::Network, false),
        Err(e) => HostReply::NoResponse {
          url,
          reason: e.to_string(),
        },
      },
    }
  }

  /// Wait for the worker's detached background work.
  pub async fn settle(&self) {
    self.worker.settle().await;
  }

  async fn activate_if_ready(&self) -> Result<()> {
    if self.worker.ready_to_activate() {
      info!("skipping wait, activating new version");
      self.worker.activate().await?;
    }
    Ok(())
  }

  fn lifecycle_reply(&self) -> HostReply {
    HostReply::Lifecycle {
      state: self.worker.state(),
    }
  }

  /// Dispatch one event, turning a failure into an error reply.
  async fn reply_to(&self, event: HostEvent) -> HostReply {
    match self.dispatch(event).await {
      Ok(reply) => reply,
      Err(e) => {
        warn!(error = %e, "host event failed");
        HostReply::error(&e)
      }
    }
  }

  /// Dispatch every event from `events`, writing one JSON reply per line.
  ///
  /// Fetches run concurrently and reply in completion order. Lifecycle events
  /// and messages wait for the fetches received before them, then run alone.
  pub async fn serve<O>(&self, events: &mut EventSource, out: &mut O) -> Result<()>
  where
    O: AsyncWrite + Unpin,
  {
    let mut in_flight = FuturesUnordered::new();
    let mut open = true;

    while open || !in_flight.is_empty() {
      tokio::select! {
        event = events.next(), if open => match event {
          Some(Event::Host(event @ HostEvent::Fetch { .. })) => in_flight.push(self.reply_to(event)),
          Some(Event::Host(event)) => {
            while let Some(reply) = in_flight.next().await {
              write_reply(out, &reply).await?;
            }
            let reply = self.reply_to(event).await;
            write_reply(out, &reply).await?;
          }
          Some(Event::Invalid(message)) => write_reply(out, &HostReply::Error { message }).await?,
          None => open = false,
        },
        Some(reply) = in_flight.next(), if !in_flight.is_empty() => write_reply(out, &reply).await?,
      }
    }

    out
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush replies: {}", e))?;
    Ok(())
  }
}

async fn write_reply<O>(out: &mut O, reply: &HostReply) -> Result<()>
where
  O: AsyncWrite + Unpin,
{
  let mut line =
    serde_json::to_string(reply).map_err(|e| eyre!("Failed to encode reply: {}", e))?;
  line.push('\n');
  out
    .write_all(line.as_bytes())
    .await
    .map_err(|e| eyre!("Failed to write reply: {}", e))
}

/// Events read from a newline-delimited JSON stream
#[derive(Debug)]
pub enum Event {
  Host(HostEvent),
  /// A line that could not be parsed
  Invalid(String),
}

/// Event source that reads host events from a line stream on a background task
pub struct EventSource {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventSource {
  pub fn new<R>(reader: R) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn line reader
    tokio::spawn(async move {
      let mut lines = reader.lines();
      loop {
        let line = match lines.next_line().await {
          Ok(Some(line)) => line,
          Ok(None) => break,
          Err(e) => {
            let _ = tx.send(Event::Invalid(format!("Failed to read event: {}", e)));
            break;
          }
        };
        if line.trim().is_empty() {
          continue;
        }

        let event = match serde_json::from_str::<HostEvent>(&line) {
          Ok(event) => Event::Host(event),
          Err(e) => Event::Invalid(format!("Invalid event {}: {}", line.trim(), e)),
        };
        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, CacheStore, MemoryStorage};
  use crate::network::mock::MockFetcher;
  use crate::worker::{CacheController, ControllerSettings};
  use serde_json::json;
  use std::io::Cursor;
  use std::time::Duration;

  const ASSETS: [&str; 5] = [
    "/",
    "/index.html",
    "/manifest.json",
    "/icons/icon-192.png",
    "/icons/icon-512.png",
  ];

  type Host = WorkerHost<CacheController<MemoryStorage, MockFetcher>, MockFetcher>;

  fn host(storage: &Arc<MemoryStorage>, fetcher: &Arc<MockFetcher>) -> Host {
    let settings = ControllerSettings {
      origin: Url::parse("https://math.test").unwrap(),
      boot_assets: ASSETS.iter().map(|s| s.to_string()).collect(),
      entry_document: "/index.html".to_string(),
      whitelist: ["fonts.gstatic.com".to_string()].into_iter().collect(),
      asset_prefix: "/assets/".to_string(),
    };
    let controller = CacheController::new(
      settings,
      CacheStore::new(Arc::clone(storage), "app-shell-v2"),
      CacheStore::new(Arc::clone(storage), "pwa-cache"),
      Arc::clone(fetcher),
    )
    .unwrap();
    WorkerHost::new(controller, Arc::clone(fetcher))
  }

  fn serve_assets(fetcher: &MockFetcher) {
    for path in ASSETS {
      fetcher.respond(&format!("https://math.test{}", path), 200, path);
    }
  }

  fn fetch(url: &str, mode: RequestMode) -> HostEvent {
    HostEvent::Fetch {
      url: url.to_string(),
      method: "GET".to_string(),
      mode,
    }
  }

  #[test]
  fn test_parse_host_events() {
    let event: HostEvent = serde_json::from_str(r#"{"event":"install"}"#).unwrap();
    assert_eq!(event, HostEvent::Install);

    let event: HostEvent =
      serde_json::from_str(r#"{"event":"fetch","url":"https://math.test/"}"#).unwrap();
    assert_eq!(event, fetch("https://math.test/", RequestMode::Cors));

    let event: HostEvent = serde_json::from_str(
      r#"{"event":"fetch","url":"https://math.test/","method":"POST","mode":"navigate"}"#,
    )
    .unwrap();
    assert_eq!(
      event,
      HostEvent::Fetch {
        url: "https://math.test/".to_string(),
        method: "POST".to_string(),
        mode: RequestMode::Navigate,
      }
    );

    let event: HostEvent =
      serde_json::from_str(r#"{"event":"message","data":{"type":"SKIP_WAITING"}}"#).unwrap();
    assert_eq!(
      event,
      HostEvent::Message {
        data: json!({ "type": "SKIP_WAITING" })
      }
    );

    assert!(serde_json::from_str::<HostEvent>(r#"{"event":"sync"}"#).is_err());
  }

  #[tokio::test]
  async fn test_install_skips_waiting_and_activates() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    serve_assets(&fetcher);
    let host = host(&storage, &fetcher);

    let reply = host.dispatch(HostEvent::Install).await.unwrap();

    assert_eq!(
      reply,
      HostReply::Lifecycle {
        state: WorkerState::Activated
      }
    );
  }

  #[tokio::test]
  async fn test_failed_install_reports_error() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    let host = host(&storage, &fetcher);

    assert!(host.dispatch(HostEvent::Install).await.is_err());
    assert_eq!(host.worker().state(), WorkerState::Redundant);
  }

  #[tokio::test]
  async fn test_fetch_before_activation_is_not_intercepted() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.respond("https://fonts.gstatic.com/font.woff2", 200, "woff2");
    let host = host(&storage, &fetcher);

    let reply = host
      .dispatch(fetch("https://fonts.gstatic.com/font.woff2", RequestMode::Cors))
      .await
      .unwrap();
    host.settle().await;

    match reply {
      HostReply::Response { intercepted, .. } => assert!(!intercepted),
      other => panic!("expected a response, got {:?}", other),
    }
    assert!(storage.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_navigation_after_install() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    serve_assets(&fetcher);
    let host = host(&storage, &fetcher);
    host.dispatch(HostEvent::Install).await.unwrap();

    fetcher.go_offline();
    let reply = host
      .dispatch(fetch("https://math.test/lesson/4", RequestMode::Navigate))
      .await
      .unwrap();

    match reply {
      HostReply::Response {
        source,
        intercepted,
        body,
        ..
      } => {
        assert_eq!(source, ResponseSource::ShellFallback);
        assert!(intercepted);
        assert_eq!(body, b"/index.html");
      }
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_unhandled_request_uses_default_network() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    serve_assets(&fetcher);
    let host = host(&storage, &fetcher);
    host.dispatch(HostEvent::Install).await.unwrap();

    let reply = host
      .dispatch(fetch("https://tracker.example.com/p.gif", RequestMode::NoCors))
      .await
      .unwrap();

    assert_eq!(
      reply,
      HostReply::NoResponse {
        url: "https://tracker.example.com/p.gif".to_string(),
        reason: "connection refused: https://tracker.example.com/p.gif".to_string(),
      }
    );
    let last = fetcher.calls().pop().unwrap();
    assert_eq!(last.cache, crate::network::CacheMode::Default);
  }

  #[tokio::test]
  async fn test_serve_writes_one_reply_per_line() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    serve_assets(&fetcher);
    fetcher.respond("https://fonts.gstatic.com/font.woff2", 200, "woff2");
    let host = host(&storage, &fetcher);

    let input = [
      r#"{"event":"install"}"#,
      "",
      r#"{"event":"fetch","url":"https://fonts.gstatic.com/font.woff2"}"#,
      r#"{"event":"message","data":{"type":"PING"}}"#,
      "not json",
    ]
    .join("\n");
    let mut events = EventSource::new(Cursor::new(input.into_bytes()));
    let mut out: Vec<u8> = Vec::new();

    host.serve(&mut events, &mut out).await.unwrap();
    host.settle().await;

    let replies: Vec<Value> = String::from_utf8(out)
      .unwrap()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0], json!({ "reply": "lifecycle", "state": "activated" }));
    assert_eq!(replies[1]["reply"], "response");
    assert_eq!(replies[1]["source"], "network");
    assert_eq!(replies[1]["intercepted"], true);
    assert_eq!(replies[1]["bytes"], 5);
    assert_eq!(replies[2], json!({ "reply": "lifecycle", "state": "activated" }));
    assert_eq!(replies[3]["reply"], "error");
  }

  #[tokio::test]
  async fn test_activate_after_failed_install_is_refused() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.respond("https://math.test/index.html", 200, "v2 index");
    let index = crate::cache::RequestKey::new("GET", "https://math.test/index.html");
    storage
      .put(
        "app-shell-v1",
        &index,
        &FetchResponse::new("https://math.test/index.html", 200, "v1 index"),
      )
      .unwrap();
    storage.set_active_version("app-shell-v1").unwrap();
    let host = host(&storage, &fetcher);

    assert!(host.dispatch(HostEvent::Install).await.is_err());
    assert!(host.dispatch(HostEvent::Activate).await.is_err());

    assert_eq!(host.worker().state(), WorkerState::Redundant);
    assert!(storage.has("app-shell-v1").unwrap());
    assert_eq!(
      storage.active_version().unwrap().as_deref(),
      Some("app-shell-v1")
    );
    let kept = storage.match_in("app-shell-v1", &index).unwrap().unwrap();
    assert_eq!(kept.response.body, b"v1 index");
  }

  #[tokio::test]
  async fn test_serve_does_not_hold_fast_fetch_behind_slow_one() {
    let storage = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(MockFetcher::new());
    serve_assets(&fetcher);
    fetcher.respond_after(
      "https://fonts.gstatic.com/slow.woff2",
      Duration::from_millis(300),
      200,
      "slow",
    );
    fetcher.respond_after(
      "https://fonts.gstatic.com/fast.woff2",
      Duration::from_millis(10),
      200,
      "fast",
    );
    let host = host(&storage, &fetcher);

    let input = [
      r#"{"event":"install"}"#,
      r#"{"event":"fetch","url":"https://fonts.gstatic.com/slow.woff2"}"#,
      r#"{"event":"fetch","url":"https://fonts.gstatic.com/fast.woff2"}"#,
    ]
    .join("\n");
    let mut events = EventSource::new(Cursor::new(input.into_bytes()));
    let mut out: Vec<u8> = Vec::new();

    host.serve(&mut events, &mut out).await.unwrap();
    host.settle().await;

    let replies: Vec<Value> = String::from_utf8(out)
      .unwrap()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0]["state"], "activated");
    assert_eq!(replies[1]["url"], "https://fonts.gstatic.com/fast.woff2");
    assert_eq!(replies[2]["url"], "https://fonts.gstatic.com/slow.woff2");
  }
}
