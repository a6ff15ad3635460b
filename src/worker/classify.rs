//! Decides how an intercepted request is handled.

use std::collections::BTreeSet;
use url::Url;

use crate::network::FetchRequest;

/// Handling strategy for one intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Top-level page load: fresh network, shell fallback when offline
  Navigation,
  /// Whitelisted GET: race cache against network, refresh runtime store
  Revalidate,
  /// Not intercepted; the host applies default network behaviour
  Passthrough,
}

/// Classifies requests by method, navigation mode and host whitelist.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
  hosts: BTreeSet<String>,
}

impl RequestClassifier {
  /// `origin`'s own host is always whitelisted alongside `extra_hosts`.
  pub fn new(origin: &Url, extra_hosts: impl IntoIterator<Item = String>) -> Self {
    let mut hosts: BTreeSet<String> = extra_hosts
      .into_iter()
      .map(|h| h.to_ascii_lowercase())
      .collect();
    if let Some(host) = origin.host_str() {
      hosts.insert(host.to_ascii_lowercase());
    }
    Self { hosts }
  }

  pub fn is_whitelisted(&self, url: &Url) -> bool {
    url
      .host_str()
      .map(|host| self.hosts.contains(&host.to_ascii_lowercase()))
      .unwrap_or(false)
  }

  pub fn classify(&self, request: &FetchRequest) -> Strategy {
    if !request.method.eq_ignore_ascii_case("GET") {
      return Strategy::Passthrough;
    }
    if request.is_navigation() {
      return Strategy::Navigation;
    }
    if self.is_whitelisted(&request.url) {
      Strategy::Revalidate
    } else {
      Strategy::Passthrough
    }
  }
}
