//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use distributed_lock_etcd::{EtcdLockProvider, EtcdMutex, KeysApi, MemoryKeysApi};

/// Lease long enough that it never runs out during a test.
pub const GENEROUS_TTL: Duration = Duration::from_secs(60);

/// Endpoints of a live etcd, from `ETCD_ENDPOINTS` (comma separated).
pub fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .collect()
}

/// Creates a mutex on `store` for `key` with a fixed holder.
pub fn memory_mutex(
    store: &MemoryKeysApi,
    key: &str,
    holder: &str,
    ttl: Duration,
) -> EtcdMutex<MemoryKeysApi> {
    EtcdMutex::builder(key)
        .holder(holder)
        .ttl(ttl)
        .build(store.clone())
        .unwrap()
}

/// Creates a provider over a fresh in-memory store.
pub fn memory_provider() -> EtcdLockProvider<MemoryKeysApi> {
    EtcdLockProvider::builder()
        .ttl(GENEROUS_TTL)
        .build_with_client(MemoryKeysApi::new())
        .unwrap()
}

/// Returns whether `key` currently exists in the store.
pub async fn key_exists<C: KeysApi>(client: &C, key: &str) -> bool {
    client.get(key).await.is_ok()
}

/// Writer collecting debug lines for inspection.
#[derive(Clone, Default)]
pub struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
