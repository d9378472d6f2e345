//! etcd lock handle implementation.

use std::sync::Arc;
use std::time::Duration;

use distributed_lock_core::error::LockResult;
use distributed_lock_core::traits::LockHandle;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::client::KeysApi;
use crate::mutex::EtcdMutex;

/// Handle for a held etcd lock.
///
/// When the mutex has a refresh cadence, the lease is extended in the
/// background while this handle exists and `lost_token` flips to `true`
/// once an extension fails.
///
/// Dropping the handle without `release()` stops the extension and frees the
/// instance locally; the key itself stays until its lease runs out.
pub struct EtcdLockHandle<C: KeysApi> {
    mutex: EtcdMutex<C>,
    /// Local guard of the mutex, given back when the handle goes away.
    _local: OwnedMutexGuard<()>,
    #[allow(dead_code)]
    lost_sender: Arc<watch::Sender<bool>>,
    lost_receiver: watch::Receiver<bool>,
    extension_task: Option<JoinHandle<()>>,
}

impl<C: KeysApi> EtcdLockHandle<C> {
    pub(crate) fn new(mutex: EtcdMutex<C>, local: OwnedMutexGuard<()>) -> Self {
        let (lost_sender, lost_receiver) = watch::channel(false);
        let lost_sender = Arc::new(lost_sender);

        let extension_task = mutex.refresh_cadence().map(|cadence| {
            let mutex = mutex.clone();
            let lost_sender = lost_sender.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(cadence);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately; the key was just created.
                interval.tick().await;

                loop {
                    interval.tick().await;

                    if lost_sender.is_closed() {
                        break;
                    }

                    if let Err(e) = mutex.refresh_lease(mutex.lease()).await {
                        warn!(lock.key = %mutex.key(), error = %e, "lease extension failed, lock may be lost");
                        let _ = lost_sender.send(true);
                        break;
                    }
                }
            })
        });

        Self {
            mutex,
            _local: local,
            lost_sender,
            lost_receiver,
            extension_task,
        }
    }

    /// Returns the mutex this handle holds.
    pub fn mutex(&self) -> &EtcdMutex<C> {
        &self.mutex
    }

    /// Resets the key's TTL to `lease`.
    ///
    /// See [`EtcdMutex::refresh_lease`].
    pub async fn refresh_lease(&self, lease: Duration) -> LockResult<()> {
        self.mutex.refresh_lease(lease).await
    }
}

impl<C: KeysApi> LockHandle for EtcdLockHandle<C> {
    fn lost_token(&self) -> &watch::Receiver<bool> {
        &self.lost_receiver
    }

    #[instrument(skip(self), fields(lock.key = %self.mutex.key(), backend = "etcd"))]
    async fn release(self) -> LockResult<()> {
        if let Some(task) = &self.extension_task {
            task.abort();
        }
        // The local guard is dropped with `self`, after the key is gone.
        self.mutex.delete_key().await
    }
}

impl<C: KeysApi> Drop for EtcdLockHandle<C> {
    fn drop(&mut self) {
        if let Some(task) = &self.extension_task {
            task.abort();
        }
    }
}
