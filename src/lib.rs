//! # Forge Query
//!
//! A client-side data-fetching cache: concurrent requests for the same key share one
//! loader invocation, cached data carries a staleness window, failed loads retry with
//! exponential backoff, and unobserved queries are garbage collected.
//!
//! ## Features
//!
//! - **De-duplication**: one loader invocation per key, however many callers wait on it
//! - **Staleness**: per-query `stale_time`, explicit invalidation by exact key or prefix
//! - **Retry**: `Never`, `UpTo(n)` or a predicate, with exponential, fixed or custom delays
//! - **Eviction**: LRU bound on the store, TTL garbage collection of inactive queries
//! - **Persistence**: optional snapshot of the store through a pluggable backend
//! - **Introspection**: event subscription, a bounded lifecycle log and snapshots
//!
//! ## Quick Start
//!
//! ```rust
//! use forge_query::{loader, query_key, ClientConfig, QueryClient, QueryFilter, QueryOptions};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client: QueryClient<Vec<String>> = QueryClient::new(ClientConfig::default());
//!
//! let users = QueryOptions::new(query_key!["users", { "page": 1 }])
//!     .with_stale_time(Duration::from_secs(30))
//!     .with_loader(loader(|_| async {
//!         Ok::<_, std::io::Error>(vec!["ada".to_string(), "grace".to_string()])
//!     }));
//!
//! let first = client.fetch_query(users).await.unwrap();
//! assert_eq!(first.len(), 2);
//!
//! // every key under ["users"] becomes stale
//! assert_eq!(client.invalidate_queries(QueryFilter::key(query_key!["users"])), 1);
//! # }
//! ```
//!
//! ## Keys
//!
//! A key is either a plain string or an array of JSON values. Array keys compare
//! structurally, so `["users"]` prefixes `["users", 1]` but not `["usersX"]`, and
//! object members are order-insensitive:
//!
//! ```rust
//! use forge_query::query_key;
//!
//! let a = query_key!["todos", { "done": false, "page": 2 }];
//! let b = query_key!["todos", { "page": 2, "done": false }];
//! assert_eq!(a.hash(), b.hash());
//! assert!(b.starts_with(&query_key!["todos"]));
//! ```
//!
//! ## Default Client
//!
//! Applications that prefer implicit access can use the process-wide client, which
//! stores `serde_json::Value` data:
//!
//! ```rust
//! use forge_query::{default_client, query_key};
//! use serde_json::json;
//!
//! default_client().set_data(&query_key!["theme"], json!("dark"));
//! assert_eq!(default_client().get_data(&query_key!["theme"]), Some(json!("dark")));
//! ```

use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub use forge_query_async::*;
pub use forge_query_core::*;

/// Client type behind [`default_client`].
pub type DefaultClient = QueryClient<serde_json::Value>;

static DEFAULT_CLIENT: Lazy<RwLock<Option<DefaultClient>>> = Lazy::new(|| RwLock::new(None));

/// Returns the process-wide client, creating it with default configuration on
/// first use.
///
/// The returned handle shares state with every other handle to the same client.
pub fn default_client() -> DefaultClient {
    if let Some(client) = DEFAULT_CLIENT.read().as_ref() {
        return client.clone();
    }
    DEFAULT_CLIENT
        .write()
        .get_or_insert_with(|| QueryClient::new(ClientConfig::default()))
        .clone()
}

/// Replaces the process-wide client
///
/// # Arguments
///
/// * `client` - The client later calls to [`default_client`] return
///
/// # Returns
///
/// The previous default client, if one had been created
///
/// # Examples
///
/// ```rust
/// use forge_query::{default_client, set_default_client, ClientConfig, QueryClient};
///
/// let client = QueryClient::new(ClientConfig::default().with_max_logs(0));
/// set_default_client(client);
/// assert!(default_client().snapshot().logs.is_empty());
/// ```
pub fn set_default_client(client: DefaultClient) -> Option<DefaultClient> {
    DEFAULT_CLIENT.write().replace(client)
}

/// Drops the process-wide client; the next [`default_client`] call creates a
/// fresh one.
///
/// # Returns
///
/// The client that was removed, if any
pub fn reset_default_client() -> Option<DefaultClient> {
    DEFAULT_CLIENT.write().take()
}

/// Invalidate queries of the default client
///
/// # Arguments
///
/// * `filter` - Selects the queries; keys match by prefix unless `exact` is set
///
/// # Returns
///
/// The number of queries that were invalidated
///
/// # Examples
///
/// ```rust
/// use forge_query::{default_client, invalidate_queries, query_key, QueryFilter};
/// use serde_json::json;
///
/// default_client().set_data(&query_key!["session", 1], json!({ "user": "ada" }));
/// assert!(invalidate_queries(QueryFilter::key(query_key!["session"])) >= 1);
/// ```
pub fn invalidate_queries(filter: QueryFilter<serde_json::Value>) -> usize {
    default_client().invalidate_queries(filter)
}

/// Remove queries from the default client
///
/// # Arguments
///
/// * `filter` - Selects the queries; keys match by prefix unless `exact` is set
///
/// # Returns
///
/// The number of queries that were removed
pub fn remove_queries(filter: QueryFilter<serde_json::Value>) -> usize {
    default_client().remove_queries(filter)
}
