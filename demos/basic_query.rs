//! Example demonstrating request de-duplication and staleness.
//!
//! Five callers ask for the same user at once; the loader runs once and every
//! caller receives the same value. A second read within the stale time is served
//! from the cache.

use forge_query::{loader, query_key, ClientConfig, QueryClient, QueryOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static LOADS: AtomicUsize = AtomicUsize::new(0);

fn user_query(id: u32) -> QueryOptions<String> {
    QueryOptions::new(query_key!["users", id])
        .with_stale_time(Duration::from_secs(30))
        .with_loader(loader(move |_| async move {
            LOADS.fetch_add(1, Ordering::SeqCst);
            println!("  [LOADER] Fetching user {}", id);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, std::io::Error>(format!("User#{}", id))
        }))
}

#[tokio::main]
async fn main() {
    println!("=== Basic Query Demo ===\n");

    let client: QueryClient<String> = QueryClient::new(ClientConfig::default());

    println!("📡 Five concurrent requests for user 1");
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.fetch_query(user_query(1)).await })
        })
        .collect();
    for handle in handles {
        match handle.await {
            Ok(Ok(user)) => println!("  -> {}", user),
            Ok(Err(err)) => println!("  -> failed: {}", err),
            Err(err) => println!("  -> task failed: {}", err),
        }
    }
    println!("Loader invocations: {}\n", LOADS.load(Ordering::SeqCst));

    println!("🗃️  Cached read");
    let record = client.resolve(user_query(1));
    println!("  data:  {:?}", record.data());
    println!("  stale: {}", record.is_stale());
    println!("Loader invocations: {}\n", LOADS.load(Ordering::SeqCst));

    let stats = client.snapshot();
    println!(
        "📊 hits: {}, misses: {}, hit rate: {:.2}",
        stats.hits, stats.misses, stats.hit_rate
    );
}
