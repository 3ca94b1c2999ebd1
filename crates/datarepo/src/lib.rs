//! Backend-agnostic data access for services.
//!
//! This crate provides the [`DataRepository`] trait and the types around it:
//! one contract for CRUD, pattern listing, search, locking, expiration,
//! counters, and pub/sub, satisfied identically by every storage engine.
//! Callers hold an `Arc<dyn DataRepository>` and never see which engine is
//! behind it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Service Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 RepositoryRegistry                          │
//! │        (backend name → async constructor)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   datarepo                                  │
//! │              DataRepository trait                           │
//! │   (create, read, list, search, locks, ttl, pub/sub, ...)    │
//! ├──────────────────┬──────────────────────────────────────────┤
//! │ MemoryRepository │   RedisRepository (in `datarepo-redis`)  │
//! │   (in-process)   │   (RedisJSON + RediSearch)               │
//! └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use datarepo::{DataRepository, EntityIdentifier, MemoryRepository};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = MemoryRepository::new();
//!     let id = EntityIdentifier::structured("user", "123");
//!
//!     repo.create(&id, json!({"name": "Ada"})).await?;
//!     assert_eq!(repo.read(&id).await?["name"], "Ada");
//!
//!     let entries = repo.list(&EntityIdentifier::structured("user", "*")).await?;
//!     assert_eq!(entries.len(), 1);
//!
//!     repo.delete(&id).await?;
//!     assert!(repo.read(&id).await.unwrap_err().is_not_found());
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Registry name | Persistence |
//! |---------|---------------|-------------|
//! | [`MemoryRepository`] | `memory` | No |
//! | `RedisRepository` (in `datarepo-redis`) | `redis` | Yes |
//!
//! # Error Handling
//!
//! All operations return [`RepositoryResult<T>`]. Every failure carries
//! exactly one [`ErrorKind`]; backends attach their internal cause as the
//! error's source.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the [`conformance`] suite and the `testutil` module with shared test
//!   helpers and assertion macros. Enable this in `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Activates `fail` injection points (`memory-ping`).

#![deny(unsafe_code)]

pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod identifier;
pub mod memory;
pub mod plugin;
pub mod registry;
pub mod repository;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;

// Re-export primary types at crate root for convenience
pub use config::{
    DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_SWEEP_INTERVAL, MemoryConfig, RepositoryConfig,
    downcast_config,
};
pub use error::{BoxError, ErrorKind, RepositoryError, RepositoryResult};
pub use identifier::{EntityIdentifier, IdentifierError};
pub use memory::{MEMORY_BACKEND_NAME, MemoryRepository};
pub use plugin::{PluginRegistry, RepositoryPlugin};
pub use registry::{Constructor, RepositoryRegistry};
pub use repository::{
    DataRepository, DataRepositoryExt, ListEntry, SearchQuery, SortDirection, Subscription,
};
