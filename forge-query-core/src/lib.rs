//! # Forge Query Core
//!
//! Building blocks shared by the forge-query crates.
//!
//! ## Module Organization
//!
//! - [`keys`] - Query keys, canonical hashing and structural prefix matching
//! - [`clock`] - Injectable time source ([`TokioClock`], [`ManualClock`])
//! - [`retry`] - Retry policy and exponential backoff
//! - [`state`] - Per-query state snapshot and status enums
//! - [`store`] - Keyed [`Store`] with LRU eviction, TTL garbage collection and
//!   optional persistence
//! - [`events`] - Cache events and panic-isolated listener fan-out
//! - [`persistence`] - Storage backend and codec traits
//!
//! ## Example
//!
//! ```
//! use forge_query_core::{query_key, QueryState, SetOptions, Store, StoreConfig};
//!
//! let store = Store::new(StoreConfig::default());
//! let key = query_key!["users", { "page": 1 }];
//! store.set(&key, QueryState::seeded(vec!["ada".to_string()], 0), SetOptions::default());
//!
//! let entry = store.get(&key).unwrap();
//! assert_eq!(entry.state.data.unwrap().len(), 1);
//! assert_eq!(store.stats().hits, 1);
//! ```

mod cache_entry;
mod error;
mod stats;

pub mod clock;
pub mod events;
pub mod keys;
pub mod persistence;
pub mod retry;
pub mod state;
pub mod store;

pub use cache_entry::CacheEntry;
pub use clock::{Clock, ManualClock, TokioClock, NEVER};
pub use error::{BoxError, QueryError, StoreError};
pub use events::{CacheEvent, CacheEventKind, Listener, ListenerSet, Unsubscribe};
pub use keys::{canonicalize, is_prefix_of, keys_match, QueryKey};
pub use persistence::{EntryCodec, JsonCodec, MemoryStorage, StorageBackend};
pub use retry::{RetryDelay, RetryPolicy};
pub use state::{FetchStatus, QueryData, QueryState, QueryStatus};
pub use stats::{CacheStats, StoreStats};
pub use store::{SetOptions, Store, StoreConfig};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
