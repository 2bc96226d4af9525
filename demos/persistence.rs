//! Example demonstrating a persisted store.
//!
//! The first client loads a report and flushes its store to a storage backend.
//! A second client opened over the same backend starts with the report already
//! cached, without calling any loader.

use forge_query::{
    loader, query_key, ClientConfig, MemoryStorage, QueryClient, QueryOptions, StorageBackend,
    StoreConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Report {
    title: String,
    rows: u32,
}

#[tokio::main]
async fn main() {
    println!("=== Persistence Demo ===\n");

    let storage = Arc::new(MemoryStorage::new());
    let store = StoreConfig::<Report>::default()
        .with_storage(storage.clone())
        .with_persist(true)
        .with_persist_key("reports");

    println!("💾 First session");
    let first = QueryClient::new(ClientConfig::default().with_store(store.clone()));
    let report = first
        .fetch_query(
            QueryOptions::new(query_key!["reports", "weekly"]).with_loader(loader(|_| async {
                println!("  [LOADER] Building weekly report");
                Ok::<_, std::io::Error>(Report {
                    title: "Weekly".to_string(),
                    rows: 42,
                })
            })),
        )
        .await;
    println!("  fetched: {:?}", report);
    first.store().flush().await;

    match storage.get_item("reports").await {
        Ok(Some(bytes)) => println!("  persisted {} bytes under \"reports\"", bytes.len()),
        Ok(None) => println!("  nothing persisted"),
        Err(err) => println!("  storage error: {}", err),
    }

    println!("\n📂 Second session");
    let second = QueryClient::open(ClientConfig::default().with_store(store)).await;
    println!(
        "  restored: {:?}",
        second.get_data(&query_key!["reports", "weekly"])
    );
    println!("  queries: {}", second.len());
}
