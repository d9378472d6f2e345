//! etcd lock provider implementation.

use std::time::Duration;

use distributed_lock_core::error::{LockError, LockResult};
use distributed_lock_core::traits::LockProvider;

use crate::client::KeysApi;
use crate::http::{DEFAULT_REQUEST_TIMEOUT, HttpKeysClient};
use crate::key::{DEFAULT_TTL, clamp_lease, holder_identity, normalize_key};
use crate::mutex::EtcdMutex;

/// Builder for etcd lock provider configuration.
pub struct EtcdLockProviderBuilder {
    endpoints: Vec<String>,
    lease: Duration,
    request_timeout: Duration,
    refresh_cadence: Option<Duration>,
    key_prefix: Option<String>,
    holder: Option<String>,
}

impl EtcdLockProviderBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            endpoints: vec![],
            lease: DEFAULT_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_cadence: None,
            key_prefix: None,
            holder: None,
        }
    }

    /// Adds an etcd endpoint URL.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(url.into());
        self
    }

    /// Adds multiple etcd endpoint URLs.
    pub fn endpoints(mut self, urls: &[impl AsRef<str>]) -> Self {
        for url in urls {
            self.endpoints.push(url.as_ref().to_string());
        }
        self
    }

    /// Sets the lease attached to lock keys.
    ///
    /// Anything below one second falls back to 60 seconds.
    pub fn ttl(mut self, lease: Duration) -> Self {
        self.lease = clamp_lease(lease);
        self
    }

    /// Sets the timeout of every request except watches.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Extends the lease of held locks every `cadence`.
    ///
    /// Should be comfortably shorter than the lease.
    pub fn refresh_cadence(mut self, cadence: Duration) -> Self {
        self.refresh_cadence = Some(cadence);
        self
    }

    /// Places every lock key under `prefix`.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Uses a fixed holder identity instead of deriving one per lock.
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Builds a provider talking to the configured endpoints.
    pub fn build(self) -> LockResult<EtcdLockProvider> {
        if self.endpoints.is_empty() {
            return Err(LockError::Configuration(
                "no etcd endpoints provided".to_string(),
            ));
        }
        let client = HttpKeysClient::new(&self.endpoints, self.request_timeout)?;
        self.build_with_client(client)
    }

    /// Builds a provider around an existing client.
    pub fn build_with_client<C: KeysApi + Clone>(self, client: C) -> LockResult<EtcdLockProvider<C>> {
        let key_prefix = self
            .key_prefix
            .map(|prefix| normalize_key(&prefix))
            .transpose()?
            .map(|prefix| prefix.trim_end_matches('/').to_string());

        Ok(EtcdLockProvider {
            client,
            lease: self.lease,
            refresh_cadence: self.refresh_cadence,
            key_prefix,
            holder: self.holder,
        })
    }
}

impl Default for EtcdLockProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider for etcd-based distributed locks.
///
/// All locks created by one provider share its client.
pub struct EtcdLockProvider<C: KeysApi + Clone = HttpKeysClient> {
    client: C,
    lease: Duration,
    refresh_cadence: Option<Duration>,
    /// Normalized prefix without a trailing separator.
    key_prefix: Option<String>,
    holder: Option<String>,
}

impl EtcdLockProvider {
    /// Returns a new builder for configuring the provider.
    pub fn builder() -> EtcdLockProviderBuilder {
        EtcdLockProviderBuilder::new()
    }

    /// Creates a provider for the given endpoints with default settings.
    pub fn new(endpoints: &[impl AsRef<str>]) -> LockResult<Self> {
        Self::builder().endpoints(endpoints).build()
    }
}

impl<C: KeysApi + Clone> EtcdLockProvider<C> {
    /// Returns the shared client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the full key a lock called `name` uses.
    pub fn key_for(&self, name: &str) -> LockResult<String> {
        let key = normalize_key(name)?;
        Ok(match &self.key_prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key,
        })
    }
}

impl<C: KeysApi + Clone> LockProvider for EtcdLockProvider<C> {
    type Lock = EtcdMutex<C>;

    fn create_lock(&self, name: &str) -> LockResult<Self::Lock> {
        let key = self.key_for(name)?;
        let holder = match &self.holder {
            Some(holder) => holder.clone(),
            None => holder_identity()?,
        };
        Ok(EtcdMutex::from_parts(
            key,
            holder,
            self.lease,
            self.client.clone(),
            self.refresh_cadence,
            None,
        ))
    }
}
