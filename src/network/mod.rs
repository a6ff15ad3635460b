//! Network access for the cache controller.
//!
//! Everything that leaves the process goes through [`Fetcher`], so the
//! controller can be driven by a scripted fake in tests.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

use color_eyre::Result;
use std::future::Future;

pub use client::HttpFetcher;
pub use types::{CacheMode, FetchRequest, FetchResponse, RequestMode};

/// Performs network fetches.
///
/// Any HTTP response, including 4xx and 5xx, resolves to `Ok`. Only transport
/// failures (DNS, refused connection, TLS, broken body) are errors.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: FetchRequest) -> impl Future<Output = Result<FetchResponse>> + Send;
}
