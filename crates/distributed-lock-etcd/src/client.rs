//! The operations the lock protocol needs from the coordination service.

use std::future::Future;
use std::time::Duration;

use crate::error::KeysResult;
use crate::response::Response;

/// Key-value operations of an etcd-style coordination service.
///
/// Implementations must provide atomic conditional writes and a monotonic
/// index shared by reads and watches.
pub trait KeysApi: Send + Sync + 'static {
    /// Watcher returned by [`KeysApi::watcher`].
    type Watcher: KeyWatcher;

    /// Creates `key` only if it is absent.
    ///
    /// Fails with `KeysError::PreconditionViolated(ErrorCode::NodeExist)`
    /// when the key already exists.
    fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = KeysResult<Response>> + Send;

    /// Reads `key`; `Response::index` is the index to anchor a watch at.
    fn get(&self, key: &str) -> impl Future<Output = KeysResult<Response>> + Send;

    /// Rewrites `key` with a new TTL only if it exists.
    ///
    /// Fails with `KeysError::NotFound` when the key is absent.
    fn update(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = KeysResult<Response>> + Send;

    /// Deletes `key`; fails with `KeysError::NotFound` when absent.
    fn delete(&self, key: &str) -> impl Future<Output = KeysResult<Response>> + Send;

    /// Watches `key` (non-recursively) for changes strictly after `after_index`.
    fn watcher(&self, key: &str, after_index: u64) -> Self::Watcher;
}

/// A stream of change events on one key, in the order they happened.
pub trait KeyWatcher: Send {
    /// Waits for the next event.
    fn next(&mut self) -> impl Future<Output = KeysResult<Response>> + Send;
}

/// Converts a lease duration to whole TTL seconds, rounding up.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}
