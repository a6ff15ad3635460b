use serde::{Deserialize, Serialize};
use url::Url;

/// How the request was issued by the page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  #[default]
  Cors,
  NoCors,
  SameOrigin,
}

/// Whether intermediate HTTP caches may answer the request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
  #[default]
  Default,
  /// Always go to the origin server
  NoStore,
}

/// An outbound request, either intercepted from the page or issued by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
  pub cache: CacheMode,
}

impl FetchRequest {
  /// A plain GET subresource request
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::default(),
      cache: CacheMode::default(),
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  /// Copy of this request that bypasses intermediate caches
  pub fn no_store(&self) -> Self {
    Self {
      cache: CacheMode::NoStore,
      ..self.clone()
    }
  }

  /// Copy of this request pointed at a different URL
  pub fn with_url(&self, url: Url) -> Self {
    Self {
      url,
      ..self.clone()
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// A complete response with its body read into memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
  pub status: u16,
  pub status_text: String,
  /// Final URL after redirects
  pub url: String,
  pub headers: Vec<(String, String)>,
  #[serde(skip)]
  pub body: Vec<u8>,
}

impl FetchResponse {
  pub fn new(url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      url: url.to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// 2xx status
  pub fn ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  /// First header value with the given name (case-insensitive)
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
