//! Scripted fetcher for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use url::Position;

use super::types::{FetchRequest, FetchResponse};
use super::Fetcher;

#[derive(Clone)]
enum Route {
  Respond {
    status: u16,
    body: Vec<u8>,
    delay: Duration,
  },
  Fail {
    delay: Duration,
  },
}

/// Routes are matched on scheme, host and path; the query string is ignored
/// so cache-busted URLs still hit their route. Unrouted URLs fail like a
/// refused connection.
#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<Vec<FetchRequest>>,
}

fn route_key(url: &str) -> String {
  match url::Url::parse(url) {
    Ok(u) => u[..Position::AfterPath].to_string(),
    Err(_) => url.to_string(),
  }
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) -> &Self {
    self.respond_after(url, Duration::ZERO, status, body)
  }

  pub fn respond_after(&self, url: &str, delay: Duration, status: u16, body: &str) -> &Self {
    self.routes.lock().unwrap().insert(
      route_key(url),
      Route::Respond {
        status,
        body: body.as_bytes().to_vec(),
        delay,
      },
    );
    self
  }

  pub fn fail(&self, url: &str) -> &Self {
    self.fail_after(url, Duration::ZERO)
  }

  pub fn fail_after(&self, url: &str, delay: Duration) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(route_key(url), Route::Fail { delay });
    self
  }

  /// Drop every route so all fetches fail
  pub fn go_offline(&self) {
    self.routes.lock().unwrap().clear();
  }

  pub fn calls(&self) -> Vec<FetchRequest> {
    self.calls.lock().unwrap().clone()
  }
}

impl Fetcher for MockFetcher {
  async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
    self.calls.lock().unwrap().push(request.clone());
    let route = self
      .routes
      .lock()
      .unwrap()
      .get(&route_key(request.url.as_str()))
      .cloned();

    match route {
      Some(Route::Respond {
        status,
        body,
        delay,
      }) => {
        tokio::time::sleep(delay).await;
        Ok(FetchResponse::new(request.url.as_str(), status, body))
      }
      Some(Route::Fail { delay }) => {
        tokio::time::sleep(delay).await;
        Err(eyre!("connection reset: {}", request.url))
      }
      None => Err(eyre!("connection refused: {}", request.url)),
    }
  }
}
