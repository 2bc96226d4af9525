//! Example demonstrating prefix invalidation, refetching and removal.
//!
//! Keys are structural: invalidating `["todos"]` marks `["todos", 1]` and
//! `["todos", { "done": true }]` stale but leaves `["todos-archive"]` alone.

use forge_query::{loader, query_key, ClientConfig, QueryClient, QueryFilter, QueryOptions, NEVER};
use serde_json::{json, Value};

fn todos(part: Value) -> QueryOptions<Value> {
    QueryOptions::new(query_key!["todos", (part.clone())])
        .with_stale_time(NEVER)
        .with_loader(loader(move |ctx| {
            let part = part.clone();
            async move {
                println!("  [LOADER] {}", ctx.key);
                Ok::<_, std::io::Error>(json!({ "filter": part, "items": [] }))
            }
        }))
}

#[tokio::main]
async fn main() {
    println!("=== Invalidation Demo ===\n");

    let client: QueryClient<Value> = QueryClient::new(ClientConfig::default());

    println!("📥 Loading queries");
    let mut watchers = Vec::new();
    for part in [json!(1), json!({ "done": true })] {
        // an observed query is active, so refetches reach it
        let record = client.resolve(todos(part));
        watchers.push(record.subscribe(|_| {}));
        if let Err(err) = record.fetch().await {
            println!("  failed: {}", err);
        }
    }
    client.set_data(&query_key!["todos-archive"], json!([]));

    for record in client.records() {
        println!("  {} stale={}", record.key(), record.is_stale());
    }

    println!("\n♻️  Invalidating [\"todos\"]");
    let invalidated = client.invalidate_queries(QueryFilter::key(query_key!["todos"]));
    println!("  invalidated: {}", invalidated);
    for record in client.records() {
        println!("  {} stale={}", record.key(), record.is_stale());
    }

    println!("\n🔄 Refetching stale todos");
    let results = client
        .refetch_queries(QueryFilter::key(query_key!["todos"]).with_predicate(|record| record.is_stale()))
        .await;
    println!("  refetched: {}", results.iter().filter(|r| r.is_ok()).count());

    println!("\n🗑️  Removing [\"todos\", 1]");
    let removed = client.remove_queries(QueryFilter::exact(query_key!["todos", 1]));
    println!("  removed: {}, remaining: {}", removed, client.len());

    for watcher in watchers {
        watcher.unsubscribe();
    }
}
