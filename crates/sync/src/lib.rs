//! Resilient cart synchronization.
//!
//! Keeps a shopping cart consistent between a durable local cache, an
//! in-memory published cart, and an authoritative remote cart service that is
//! only reachable with a bearer credential.
//!
//! # Architecture
//!
//! - [`storage`] - durable key-value records (cart, credential, opt-out flag)
//! - [`credential`] - credential store and the coalescing lifecycle coordinator
//! - [`gateway`] - the four remote cart operations and response normalization
//! - [`cache`] - write-through copy of the last published cart
//! - [`engine`] - the orchestrator: retries, fallbacks, arbitration
//! - [`session`] - wires the above together from a [`SyncConfig`]
//!
//! # Example
//!
//! ```rust,ignore
//! let session = CartSession::new(SyncConfig::from_env()?)?;
//! let engine = session.engine();
//!
//! let mut updates = engine.subscribe();
//! engine.fetch().await;
//! engine.set_quantity(LineId::from("line-1"), 3).await;
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cache;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod session;
pub mod storage;

pub use cache::CartCache;
pub use config::{ConfigError, Environment, SyncConfig};
pub use credential::{
    CoordinatorSettings, CredentialCoordinator, CredentialError, CredentialStore,
};
pub use engine::{CartSyncEngine, EngineSettings, RetryPolicy, SyncPhase, SyncState};
pub use error::{ErrorKind, Result, SyncError};
pub use gateway::{CartApi, GatewayError, HttpCartGateway};
pub use session::CartSession;
pub use storage::{FileStore, KeyValueStore, MemoryStore, SharedStore, StorageError};
