//! Example: Locks over the in-memory keys store
//!
//! Run with: `cargo run --example memory_lock`
//!
//! Runs without an etcd server. Several workers share one store and take
//! turns on the same lock while their leases are extended in the background.

use distributed_lock::{EtcdLockProvider, MemoryKeysApi};
use distributed_lock_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let provider = Arc::new(
        EtcdLockProvider::builder()
            .ttl(Duration::from_secs(2))
            .refresh_cadence(Duration::from_millis(500))
            .build_with_client(MemoryKeysApi::new())?,
    );

    let mut workers = Vec::new();
    for worker in 0..3 {
        let provider = provider.clone();
        workers.push(tokio::spawn(async move {
            let lock = provider.create_lock("shared-resource")?;
            let handle = lock.acquire(Some(Duration::from_secs(30))).await?;
            println!("worker {worker} holds {}", lock.name());

            // Outlives the lease; the background extension keeps it held
            tokio::time::sleep(Duration::from_secs(3)).await;
            if *handle.lost_token().borrow() {
                println!("worker {worker} lost the lock");
            }

            handle.release().await?;
            println!("worker {worker} released {}", lock.name());
            Ok::<_, LockError>(())
        }));
    }

    for worker in workers {
        worker.await??;
    }

    Ok(())
}
