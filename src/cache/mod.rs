//! Named response stores for offline delivery.
//!
//! This module provides the storage side of the cache controller:
//! - A generation set of named stores, addressed by name
//! - Per-store handles injected into the controller
//! - An SQLite backend that survives restarts and a memory backend for tests
//!   and ephemeral runs

mod storage;
mod store;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use store::CacheStore;
pub use traits::{CacheStorage, RequestKey, ResponseSource};
