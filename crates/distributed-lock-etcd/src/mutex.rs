//! etcd-backed distributed mutex.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use distributed_lock_core::error::{LockError, LockResult};
use distributed_lock_core::traits::DistributedLock;
use tokio::sync::OwnedMutexGuard;
use tracing::{Span, field, instrument, warn};

use crate::client::{KeyWatcher, KeysApi};
use crate::debug::{DebugLog, DebugSink};
use crate::error::KeysError;
use crate::handle::EtcdLockHandle;
use crate::http::{DEFAULT_REQUEST_TIMEOUT, HttpKeysClient};
use crate::key::{DEFAULT_TTL, clamp_lease, holder_identity, lease_from_secs, normalize_key};

/// Number of acquisition rounds `lock` runs, and delete attempts `unlock`
/// makes, before giving up.
pub const DEFAULT_TRY: u32 = 3;

/// Where an acquisition round currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Trying to create the key.
    Creating,
    /// The key exists; waiting for it to be deleted or to expire.
    Watching { after_index: u64 },
}

struct Shared<C> {
    key: String,
    holder: String,
    lease: Duration,
    client: C,
    /// Serializes local callers of this instance.
    local: Arc<tokio::sync::Mutex<()>>,
    /// Local guard kept between `lock` and `unlock`.
    held: parking_lot::Mutex<Option<OwnedMutexGuard<()>>>,
    refresh_cadence: Option<Duration>,
    debug: DebugLog,
}

/// A mutual exclusion lock shared across a cluster through etcd.
///
/// Ownership is the existence of the lock key: `lock` creates it with a
/// TTL under a create-if-absent precondition and, when it already exists,
/// watches it until it is deleted or expires. The key holds the holder
/// identity for diagnostics only.
///
/// One instance is one remote lock slot. Concurrent local callers are
/// serialized by a local guard taken in `lock` and given back in `unlock`,
/// so clones of an instance (which share that guard) never race each other
/// in the remote protocol.
///
/// # Example
///
/// ```rust,no_run
/// use distributed_lock_etcd::EtcdMutex;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mutex = EtcdMutex::new("/mylock", 10, &["http://127.0.0.1:2379"])?;
/// mutex.lock().await?;
/// // Critical section
/// mutex.unlock().await?;
/// # Ok(())
/// # }
/// ```
pub struct EtcdMutex<C: KeysApi = HttpKeysClient> {
    shared: Arc<Shared<C>>,
}

impl<C: KeysApi> Clone for EtcdMutex<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl EtcdMutex<HttpKeysClient> {
    /// Creates a mutex for `key` on the etcd cluster at `endpoints`.
    ///
    /// `ttl` is the lease in seconds; values below one fall back to 60.
    /// Only the client handle is built; the cluster is not contacted.
    ///
    /// # Errors
    ///
    /// * `LockError::Configuration` - empty key or endpoint list
    /// * `LockError::Environment` - the host name cannot be determined
    /// * `LockError::Connectivity` - an endpoint is not a usable URL
    pub fn new(key: &str, ttl: i64, endpoints: &[impl AsRef<str>]) -> LockResult<Self> {
        if endpoints.is_empty() {
            return Err(LockError::Configuration(
                "no etcd endpoints provided".to_string(),
            ));
        }
        let key = normalize_key(key)?;
        let holder = holder_identity()?;
        let client = HttpKeysClient::new(endpoints, DEFAULT_REQUEST_TIMEOUT)?;

        Ok(Self::from_parts(
            key,
            holder,
            lease_from_secs(ttl),
            client,
            None,
            None,
        ))
    }

    /// Returns a builder for a mutex over any [`KeysApi`] client.
    ///
    /// The client type is chosen by [`EtcdMutexBuilder::build`].
    pub fn builder(key: impl Into<String>) -> EtcdMutexBuilder {
        EtcdMutexBuilder::new(key)
    }
}

impl<C: KeysApi> EtcdMutex<C> {
    pub(crate) fn from_parts(
        key: String,
        holder: String,
        lease: Duration,
        client: C,
        refresh_cadence: Option<Duration>,
        debug: Option<DebugSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                key,
                holder,
                lease,
                client,
                local: Arc::new(tokio::sync::Mutex::new(())),
                held: parking_lot::Mutex::new(None),
                refresh_cadence,
                debug: DebugLog::new(debug),
            }),
        }
    }

    /// Returns the normalized lock key.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Returns the identity written as the lock value.
    pub fn holder(&self) -> &str {
        &self.shared.holder
    }

    /// Returns the lease attached to the key on creation.
    pub fn lease(&self) -> Duration {
        self.shared.lease
    }

    /// Returns the coordination client.
    pub fn client(&self) -> &C {
        &self.shared.client
    }

    /// Returns how often handles extend the lease in the background.
    pub fn refresh_cadence(&self) -> Option<Duration> {
        self.shared.refresh_cadence
    }

    /// Sends a line per protocol step to `sink`, prefixed with the holder.
    pub fn set_debug_logger(&self, sink: impl Write + Send + 'static) {
        self.shared.debug.set_sink(Some(Box::new(sink)));
    }

    /// Stops writing protocol steps to the debug sink.
    pub fn clear_debug_logger(&self) {
        self.shared.debug.set_sink(None);
    }

    fn debug(&self, message: std::fmt::Arguments<'_>) {
        self.shared
            .debug
            .log(&self.shared.holder, &self.shared.key, message);
    }

    /// Locks the mutex, waiting until the key can be created.
    ///
    /// Runs up to [`DEFAULT_TRY`] acquisition rounds; the error of the last
    /// round is returned when all of them fail. A failed or cancelled call
    /// gives the local guard back.
    #[instrument(skip(self), fields(lock.key = %self.shared.key, backend = "etcd", acquired = field::Empty, elapsed_ms = field::Empty))]
    pub async fn lock(&self) -> LockResult<()> {
        let local = self.lock_guarded().await?;
        *self.shared.held.lock() = Some(local);
        Ok(())
    }

    /// Runs the acquisition protocol and returns the local guard on success.
    pub(crate) async fn lock_guarded(&self) -> LockResult<OwnedMutexGuard<()>> {
        let start = std::time::Instant::now();
        let local = self.shared.local.clone().lock_owned().await;

        let mut attempt = 1;
        loop {
            match self.lock_round().await {
                Ok(()) => {
                    Span::current().record("acquired", true);
                    Span::current().record("elapsed_ms", start.elapsed().as_millis() as u64);
                    return Ok(local);
                }
                Err(e) if attempt < DEFAULT_TRY => {
                    self.debug(format_args!("Lock node {} ERROR {}", self.shared.key, e));
                    self.debug(format_args!("Try to lock node {} again", self.shared.key));
                    attempt += 1;
                }
                Err(e) => {
                    self.debug(format_args!("Lock node {} ERROR {}", self.shared.key, e));
                    Span::current().record("acquired", false);
                    warn!(lock.key = %self.shared.key, attempts = attempt, error = %e, "giving up on lock");
                    return Err(e);
                }
            }
        }
    }

    /// One acquisition round: create, or wait for the key to go away and
    /// create again.
    async fn lock_round(&self) -> LockResult<()> {
        let key = self.shared.key.as_str();
        let mut phase = Phase::Creating;

        loop {
            phase = match phase {
                Phase::Creating => {
                    self.debug(format_args!("Trying to create a node : key={key}"));
                    let created = self
                        .shared
                        .client
                        .create(key, &self.shared.holder, self.shared.lease)
                        .await;
                    match created {
                        Ok(response) => {
                            self.debug(format_args!(
                                "Create node {key} OK [index {}]",
                                response.node.modified_index
                            ));
                            return Ok(());
                        }
                        Err(e) if e.is_node_exist() => {
                            self.debug(format_args!("Create node {key} failed [{e}]"));
                            self.anchor_watch().await?
                        }
                        Err(e) => {
                            self.debug(format_args!("Create node {key} failed [{e}]"));
                            return Err(e.into());
                        }
                    }
                }
                Phase::Watching { after_index } => {
                    let mut watcher = self.shared.client.watcher(key, after_index);
                    loop {
                        self.debug(format_args!("Watching {key} ..."));
                        let event = watcher.next().await?;
                        self.debug(format_args!(
                            "Received an event : {:?} at index {}",
                            event.action, event.index
                        ));
                        if event.action.frees_key() {
                            break;
                        }
                    }
                    Phase::Creating
                }
            };
        }
    }

    /// Reads the existing key to find the index a watch starts after.
    async fn anchor_watch(&self) -> LockResult<Phase> {
        let key = self.shared.key.as_str();
        match self.shared.client.get(key).await {
            Ok(current) => {
                self.debug(format_args!(
                    "Get node {key} OK [held by {}]",
                    current.node.value.as_deref().unwrap_or_default()
                ));
                Ok(Phase::Watching {
                    after_index: current.index,
                })
            }
            // Released between the failed create and the read.
            Err(KeysError::NotFound) => {
                self.debug(format_args!("Get node {key}: already released"));
                Ok(Phase::Creating)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Makes a single attempt to create the key.
    ///
    /// Returns the local guard when the key was created, `None` when the key
    /// exists or another local caller holds the instance.
    pub(crate) async fn try_lock_guarded(&self) -> LockResult<Option<OwnedMutexGuard<()>>> {
        let Ok(local) = self.shared.local.clone().try_lock_owned() else {
            return Ok(None);
        };

        let key = self.shared.key.as_str();
        self.debug(format_args!("Trying to create a node : key={key}"));
        let created = self
            .shared
            .client
            .create(key, &self.shared.holder, self.shared.lease)
            .await;
        match created {
            Ok(_) => {
                self.debug(format_args!("Create node {key} OK"));
                Ok(Some(local))
            }
            Err(e) if e.is_node_exist() => {
                self.debug(format_args!("Create node {key} failed [{e}]"));
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts to lock the mutex without waiting.
    ///
    /// Returns `true` when the lock was taken.
    pub async fn try_lock(&self) -> LockResult<bool> {
        match self.try_lock_guarded().await? {
            Some(local) => {
                *self.shared.held.lock() = Some(local);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unlocks the mutex by deleting the key.
    ///
    /// A missing key counts as released. Other failures are retried up to
    /// [`DEFAULT_TRY`] times. The local guard is given back on return,
    /// whatever the outcome.
    ///
    /// Ownership is not checked: unlocking an instance that never locked
    /// deletes the key of whoever holds it.
    #[instrument(skip(self), fields(lock.key = %self.shared.key, backend = "etcd"))]
    pub async fn unlock(&self) -> LockResult<()> {
        let _local = self.shared.held.lock().take();
        self.delete_key().await
    }

    pub(crate) async fn delete_key(&self) -> LockResult<()> {
        let key = self.shared.key.as_str();
        let mut attempt = 1;
        loop {
            match self.shared.client.delete(key).await {
                Ok(_) => {
                    self.debug(format_args!("Delete {key} OK"));
                    return Ok(());
                }
                Err(KeysError::NotFound) => {
                    self.debug(format_args!("Delete {key}: key not found"));
                    return Ok(());
                }
                Err(e) => {
                    self.debug(format_args!("Delete {key} failed: {e}"));
                    if attempt >= DEFAULT_TRY {
                        return Err(e.into());
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Resets the key's TTL to `lease`, provided the key still exists.
    ///
    /// A failure means ownership may already be lost; the caller should
    /// re-acquire or abort its work.
    #[instrument(skip(self), fields(lock.key = %self.shared.key, backend = "etcd"))]
    pub async fn refresh_lease(&self, lease: Duration) -> LockResult<()> {
        let key = self.shared.key.as_str();
        match self
            .shared
            .client
            .update(key, &self.shared.holder, lease)
            .await
        {
            Ok(_) => {
                self.debug(format_args!("Refresh ttl of {key} OK"));
                Ok(())
            }
            Err(e) => {
                self.debug(format_args!("Refresh ttl of {key} failed [{e}]"));
                Err(e.into())
            }
        }
    }
}

impl<C: KeysApi> std::fmt::Debug for EtcdMutex<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdMutex")
            .field("key", &self.shared.key)
            .field("holder", &self.shared.holder)
            .field("lease", &self.shared.lease)
            .finish()
    }
}

impl<C: KeysApi> DistributedLock for EtcdMutex<C> {
    type Handle = EtcdLockHandle<C>;

    fn name(&self) -> &str {
        &self.shared.key
    }

    #[instrument(skip(self), fields(lock.key = %self.shared.key, timeout = ?timeout, backend = "etcd", acquired = field::Empty, elapsed_ms = field::Empty))]
    async fn acquire(&self, timeout: Option<Duration>) -> LockResult<Self::Handle> {
        let local = match timeout {
            None => self.lock_guarded().await?,
            Some(timeout) => tokio::time::timeout(timeout, self.lock_guarded())
                .await
                .map_err(|_| LockError::Timeout(timeout))??,
        };
        Ok(EtcdLockHandle::new(self.clone(), local))
    }

    #[instrument(skip(self), fields(lock.key = %self.shared.key, backend = "etcd", acquired = field::Empty))]
    async fn try_acquire(&self) -> LockResult<Option<Self::Handle>> {
        let handle = self
            .try_lock_guarded()
            .await?
            .map(|local| EtcdLockHandle::new(self.clone(), local));
        Span::current().record("acquired", handle.is_some());
        Ok(handle)
    }
}

/// Builder for an [`EtcdMutex`] over any [`KeysApi`] client.
pub struct EtcdMutexBuilder {
    key: String,
    lease: Duration,
    holder: Option<String>,
    refresh_cadence: Option<Duration>,
    debug: Option<DebugSink>,
}

impl EtcdMutexBuilder {
    /// Creates a builder for `key` with the default lease.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            lease: DEFAULT_TTL,
            holder: None,
            refresh_cadence: None,
            debug: None,
        }
    }

    /// Sets the lease; anything below one second falls back to the default.
    pub fn ttl(mut self, lease: Duration) -> Self {
        self.lease = clamp_lease(lease);
        self
    }

    /// Uses `holder` as the lock value instead of a derived identity.
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Makes handles extend the lease every `cadence` while they live.
    pub fn refresh_cadence(mut self, cadence: Duration) -> Self {
        self.refresh_cadence = Some(cadence);
        self
    }

    /// Sends a line per protocol step to `sink`.
    pub fn debug_logger(mut self, sink: impl Write + Send + 'static) -> Self {
        self.debug = Some(Box::new(sink));
        self
    }

    /// Builds the mutex around `client`.
    pub fn build<C: KeysApi>(self, client: C) -> LockResult<EtcdMutex<C>> {
        let key = normalize_key(&self.key)?;
        let holder = match self.holder {
            Some(holder) => holder,
            None => holder_identity()?,
        };
        Ok(EtcdMutex::from_parts(
            key,
            holder,
            self.lease,
            client,
            self.refresh_cadence,
            self.debug,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKeysApi;

    fn mutex(store: &MemoryKeysApi, holder: &str) -> EtcdMutex<MemoryKeysApi> {
        EtcdMutex::builder("mylock")
            .holder(holder)
            .build(store.clone())
            .unwrap()
    }

    #[test]
    fn test_new_validates_configuration() {
        let endpoints = ["http://127.0.0.1:2379"];
        assert!(matches!(
            EtcdMutex::new("", 10, &endpoints),
            Err(LockError::Configuration(_))
        ));

        let none: [&str; 0] = [];
        assert!(matches!(
            EtcdMutex::new("mylock", 10, &none),
            Err(LockError::Configuration(_))
        ));

        assert!(matches!(
            EtcdMutex::new("mylock", 10, &["::not a url::"]),
            Err(LockError::Connectivity(_))
        ));
    }

    #[test]
    fn test_new_normalizes_key_and_lease() {
        let mutex = EtcdMutex::new("mylock", 0, &["http://127.0.0.1:2379"]).unwrap();
        assert_eq!(mutex.key(), "/mylock");
        assert_eq!(mutex.lease(), DEFAULT_TTL);
        assert!(mutex.holder().contains(&std::process::id().to_string()));

        let mutex = EtcdMutex::new("/mylock", 5, &["http://127.0.0.1:2379"]).unwrap();
        assert_eq!(mutex.key(), "/mylock");
        assert_eq!(mutex.lease(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lock_writes_holder_and_unlock_deletes() {
        let store = MemoryKeysApi::new();
        let mutex = mutex(&store, "holder-a");

        mutex.lock().await.unwrap();
        let node = store.get("/mylock").await.unwrap().node;
        assert_eq!(node.value.as_deref(), Some("holder-a"));
        assert_eq!(node.ttl, Some(60));

        mutex.unlock().await.unwrap();
        assert!(store.get("/mylock").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_idempotent() {
        let store = MemoryKeysApi::new();
        let mutex = mutex(&store, "holder-a");
        mutex.unlock().await.unwrap();
        mutex.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_try_lock_reports_contention() {
        let store = MemoryKeysApi::new();
        let a = mutex(&store, "holder-a");
        let b = mutex(&store, "holder-b");

        assert!(a.try_lock().await.unwrap());
        assert!(!b.try_lock().await.unwrap());
        // The same instance is busy locally as well.
        assert!(!a.try_lock().await.unwrap());

        a.unlock().await.unwrap();
        assert!(b.try_lock().await.unwrap());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_callers_are_serialized() {
        let store = MemoryKeysApi::new();
        let mutex = mutex(&store, "holder-a");
        mutex.lock().await.unwrap();

        let second = mutex.clone();
        let waiter = tokio::spawn(async move {
            second.lock().await.unwrap();
            second.unlock().await.unwrap();
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        mutex.unlock().await.unwrap();
        waiter.await.unwrap();
        assert!(store.get("/mylock").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_refresh_lease_requires_key() {
        let store = MemoryKeysApi::new();
        let mutex = mutex(&store, "holder-a");

        let err = mutex.refresh_lease(Duration::from_secs(30)).await.unwrap_err();
        let source = err.coordination_source().unwrap();
        assert!(source.downcast_ref::<KeysError>().unwrap().is_not_found());

        mutex.lock().await.unwrap();
        mutex.refresh_lease(Duration::from_secs(30)).await.unwrap();
        let node = store.get("/mylock").await.unwrap().node;
        assert_eq!(node.ttl, Some(30));
        assert_eq!(node.value.as_deref(), Some("holder-a"));
        mutex.unlock().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_while_key_is_held() {
        let store = MemoryKeysApi::new();
        let a = mutex(&store, "holder-a");
        let b = mutex(&store, "holder-b");
        a.lock().await.unwrap();

        let result = b.acquire(Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(LockError::Timeout(_))));

        // The timed-out call gave its local guard back.
        assert!(!b.try_lock().await.unwrap());
        a.unlock().await.unwrap();
        assert!(b.try_lock().await.unwrap());
    }
}
