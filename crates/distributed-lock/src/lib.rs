//! Distributed mutual exclusion over an etcd coordination service.
//!
//! A lock is a key in etcd. Acquiring creates the key with a TTL under a
//! create-if-absent precondition; contenders watch the key and retry when it
//! is deleted or expires. Releasing deletes the key.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use distributed_lock::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = EtcdLockProvider::builder()
//!         .endpoint("http://127.0.0.1:2379")
//!         .ttl(Duration::from_secs(30))
//!         .build()?;
//!
//!     let lock = provider.create_lock("my-resource")?;
//!
//!     // Acquire the lock with a timeout
//!     let handle = lock.acquire(Some(Duration::from_secs(5))).await?;
//!
//!     // Critical section - we have exclusive access
//!     println!("Doing critical work...");
//!
//!     handle.release().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Plain mutex API
//!
//! ```rust,no_run
//! use distributed_lock::EtcdMutex;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mutex = EtcdMutex::new("/mylock", 10, &["http://127.0.0.1:2379"])?;
//! mutex.set_debug_logger(std::io::stdout());
//! mutex.lock().await?;
//! mutex.refresh_lease(Duration::from_secs(10)).await?;
//! mutex.unlock().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Crate Organization
//!
//! This is a meta-crate that re-exports types from:
//! - `distributed-lock-core`: Core traits and types
//! - `distributed-lock-etcd`: etcd backend and an in-memory store with the
//!   same semantics
//!
//! For fine-grained control, you can depend on individual crates instead.

// Re-export core types and traits
pub use distributed_lock_core::*;

// Re-export etcd backend
#[allow(ambiguous_glob_reexports)]
pub use distributed_lock_etcd::*;
