//! Rewrites the outbound URL of a revalidate fetch.

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

/// Query parameter carrying the cache-busting timestamp
pub const CACHE_BUST_PARAM: &str = "cache-bust";

#[derive(Debug, Clone)]
pub struct UrlNormalizer {
  origin: Url,
  asset_prefix: String,
}

impl UrlNormalizer {
  pub fn new(origin: Url, asset_prefix: impl Into<String>) -> Self {
    Self {
      origin,
      asset_prefix: asset_prefix.into(),
    }
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// URL to fetch for `url`, stamped with `now` when it gets cache-busted.
  ///
  /// Content-hashed same-origin assets come back untouched. Everything else
  /// takes the origin's scheme, and same-origin URLs get a `cache-bust`
  /// query parameter.
  pub fn normalize(&self, url: &Url, now: DateTime<Utc>) -> Url {
    if self.is_same_origin(url) && url.path().starts_with(&self.asset_prefix) {
      return url.clone();
    }

    let mut normalized = url.clone();
    if normalized.scheme() != self.origin.scheme()
      && normalized.set_scheme(self.origin.scheme()).is_err()
    {
      debug!(url = %url, "scheme rewrite not possible, keeping original scheme");
    }

    if self.is_same_origin(&normalized) {
      normalized
        .query_pairs_mut()
        .append_pair(CACHE_BUST_PARAM, &now.timestamp_millis().to_string());
    }

    normalized
  }
}
