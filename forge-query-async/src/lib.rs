//! # Forge Query Async
//!
//! Async query lifecycle on top of [`forge_query_core`].
//!
//! A [`QueryRecord`] owns one key's state and its loader. Concurrent fetches of
//! the same record share one loader invocation; failed attempts are retried
//! according to the record's [`RetryPolicy`](forge_query_core::RetryPolicy) and
//! [`RetryDelay`](forge_query_core::RetryDelay). Records with no subscribers are
//! evicted after their `gc_time`.
//!
//! A [`QueryClient`] registers records by key hash, mirrors their state into a
//! [`Store`](forge_query_core::Store) and runs bulk operations over
//! [`QueryFilter`]s.
//!
//! ## Quick Start
//!
//! ```
//! use forge_query_async::{loader, ClientConfig, QueryClient, QueryOptions};
//! use forge_query_core::query_key;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client: QueryClient<String> = QueryClient::new(ClientConfig::default());
//!
//! let options = QueryOptions::new(query_key!["user", 1])
//!     .with_stale_time(Duration::from_secs(60))
//!     .with_loader(loader(|ctx| async move {
//!         Ok::<_, std::io::Error>(format!("loaded {}", ctx.key))
//!     }));
//!
//! let name = client.fetch_query(options).await.unwrap();
//! assert_eq!(name, r#"loaded ["user",1]"#);
//! # }
//! ```
//!
//! ## Events
//!
//! [`QueryClient::subscribe`] receives every store event (`get`, `set`, `delete`,
//! `clear`, `gc`) plus the record lifecycle events `fetch`, `success`, `error`
//! and `invalidate`. A panicking listener is logged and skipped.

mod client;
mod filter;
mod log;
mod options;
mod record;

pub use client::{ClientConfig, ClientSnapshot, QueryClient, RecordSnapshot};
pub use filter::QueryFilter;
pub use log::{EventLog, LogEntry, LogKind, DEFAULT_MAX_LOGS};
pub use options::{
    loader, ErrorCallback, Loader, QueryContext, QueryDefaults, QueryOptions, SettledCallback,
    SuccessCallback,
};
pub use record::{FetchFuture, QueryRecord, RecordChange, RecordObserver};
