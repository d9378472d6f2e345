//! Benchmarks for lock acquisition latency

use criterion::{Criterion, criterion_group, criterion_main};
use distributed_lock::{EtcdLockProvider, EtcdMutex, MemoryKeysApi};
use distributed_lock_core::prelude::*;
use std::time::Duration;

fn bench_memory_lock_acquisition(c: &mut Criterion) {
    let provider = EtcdLockProvider::builder()
        .holder("bench")
        .build_with_client(MemoryKeysApi::new())
        .unwrap();

    let lock = provider.create_lock("bench-lock").unwrap();

    let mut group = c.benchmark_group("memory_lock");
    group.bench_function("try_acquire", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                if let Ok(Some(handle)) = lock.try_acquire().await {
                    let _ = handle.release().await;
                }
            });
    });

    group.bench_function("acquire_no_wait", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                if let Ok(handle) = lock.acquire(Some(Duration::from_millis(1))).await {
                    let _ = handle.release().await;
                }
            });
    });

    let mutex = EtcdMutex::builder("/bench-mutex")
        .holder("bench")
        .build(MemoryKeysApi::new())
        .unwrap();
    group.bench_function("lock_unlock", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                if mutex.lock().await.is_ok() {
                    let _ = mutex.unlock().await;
                }
            });
    });

    group.finish();
}

criterion_group!(benches, bench_memory_lock_acquisition);
criterion_main!(benches);
