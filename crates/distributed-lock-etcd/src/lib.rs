//! etcd backend for distributed locks.
//!
//! A lock is a key created with a TTL under a create-if-absent
//! precondition. Contenders that find the key watch it and retry the create
//! once it is deleted or expires, so waiting costs no polling.

pub mod client;
mod debug;
pub mod error;
pub mod handle;
pub mod http;
pub mod key;
pub mod memory;
pub mod mutex;
pub mod provider;
pub mod response;

pub use client::{KeyWatcher, KeysApi};
pub use debug::DebugSink;
pub use error::{ErrorCode, KeysError, KeysResult};
pub use handle::EtcdLockHandle;
pub use http::{HttpKeyWatcher, HttpKeysClient};
pub use key::DEFAULT_TTL;
pub use memory::{MemoryKeyWatcher, MemoryKeysApi};
pub use mutex::{DEFAULT_TRY, EtcdMutex, EtcdMutexBuilder};
pub use provider::{EtcdLockProvider, EtcdLockProviderBuilder};
pub use response::{Action, Node, Response};
