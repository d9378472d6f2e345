//! Example: Using etcd distributed locks
//!
//! Run with: `cargo run --example etcd_lock`
//!
//! Requires an etcd server exposing the v2 keys API. Set ETCD_ENDPOINTS
//! (comma separated) or modify the URL below.

use distributed_lock::EtcdMutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoints: Vec<String> = std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .collect();

    println!("Connecting to etcd at {endpoints:?}...");
    let mutex = EtcdMutex::new("/example/mylock", 10, &endpoints)?;
    mutex.set_debug_logger(std::io::stdout());
    println!("Created mutex for {} as {}", mutex.key(), mutex.holder());

    println!("Locking...");
    mutex.lock().await?;
    println!("Lock acquired!");

    // Long-running work must keep the key alive
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        mutex.refresh_lease(Duration::from_secs(10)).await?;
        println!("Lease refreshed");
    }

    mutex.unlock().await?;
    println!("Lock released");

    Ok(())
}
