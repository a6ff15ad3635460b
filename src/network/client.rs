use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::Method;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

use super::types::{CacheMode, FetchRequest, FetchResponse};
use super::Fetcher;

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-shell/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(Duration::from_secs(config.network.connect_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    if request.cache == CacheMode::NoStore {
      builder = builder
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "fetched");

    Ok(FetchResponse {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      url,
      headers,
      body: body.to_vec(),
    })
  }
}
