//! First-result race between a cache lookup and a network fetch.

use futures::future::{select, Either};
use std::future::Future;

/// Race a cache lookup against a network fetch.
///
/// - cache settles first with a hit: the hit wins
/// - cache settles first with a miss or an error: wait for the network
/// - network settles first with a value: the value wins
/// - network fails: wait for the cache
///
/// Errors from either side are swallowed; `None` means both came up empty.
pub async fn race_with_fallback<T, CE, NE, C, N>(cache: C, network: N) -> Option<T>
where
  C: Future<Output = Result<Option<T>, CE>>,
  N: Future<Output = Result<T, NE>>,
{
  let cache = std::pin::pin!(cache);
  let network = std::pin::pin!(network);

  match select(cache, network).await {
    Either::Left((cached, network)) => match cached {
      Ok(Some(hit)) => Some(hit),
      Ok(None) | Err(_) => network.await.ok(),
    },
    Either::Right((fetched, cache)) => match fetched {
      Ok(value) => Some(value),
      Err(_) => cache.await.ok().flatten(),
    },
  }
}
