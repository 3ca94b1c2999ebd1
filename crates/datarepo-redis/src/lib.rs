//! Redis implementation of the [`DataRepository`](datarepo::DataRepository) contract.
//!
//! Documents live in RedisJSON, search runs through RediSearch, locks and
//! TTLs use native key expiry, and pub/sub uses Redis channels. Single-node,
//! Sentinel, and Cluster deployments are supported.
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a running Redis server with the RedisJSON and RediSearch modules.
//! use datarepo::{DataRepository, EntityIdentifier};
//! use datarepo_redis::{RedisConfig, RedisRepository};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .connection_string("single;main;;;;;;0;localhost:6379")
//!         .key_prefix("app")
//!         .build()?;
//!
//!     let repo = RedisRepository::connect(config).await?;
//!
//!     let id = EntityIdentifier::structured("user", "123");
//!     repo.create(&id, json!({ "name": "Ada" })).await?;
//!     assert_eq!(repo.read(&id).await?["name"], "Ada");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Connection Descriptor
//!
//! The connection string is nine `;`-separated positional fields:
//!
//! ```text
//! mode;name;masterName;sentinelUsername;sentinelPassword;username;password;dbIndex;host:port[,host:port...]
//! ```
//!
//! `mode` is one of `single`, `sentinel`, or `cluster`. Ports default to
//! 6379, or 26379 for sentinel nodes.
//!
//! # Key Layout
//!
//! | Identifier | Key |
//! |------------|-----|
//! | `Structured { prefix: "user", id: "1" }` | `app:user:1` |
//! | `Simple("token")` | `app:token` |
//! | lock on `user:1` | `app:user:1:lock` |
//! | channel `events` | `app:channel:events` |
//!
//! # Registry
//!
//! ```
//! use datarepo::RepositoryRegistry;
//!
//! let registry = RepositoryRegistry::with_defaults();
//! datarepo_redis::register(&registry);
//! assert_eq!(registry.registered_names(), vec!["memory", "redis"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod connection;
mod error;
pub mod keys;
mod plugin;

use std::sync::Arc;

use datarepo::{
    downcast_config, Constructor, DataRepository, RepositoryConfig, RepositoryRegistry,
    RepositoryResult,
};
use futures::FutureExt;

/// Redis-backed repository and its registry name.
pub use backend::{RedisRepository, REDIS_BACKEND_NAME};
/// Configuration and connection descriptor types.
pub use config::{RedisConfig, ServerInfo, Topology, DEFAULT_REDIS_PORT, DEFAULT_SENTINEL_PORT};
/// Redis-specific error types and result alias.
pub use error::{RedisRepositoryError, Result};
/// Key codec types.
pub use keys::{KeyCodec, KeyError, KeyMode};
/// Raw command plugin.
pub use plugin::{RedisCommandPlugin, REDIS_COMMAND_PLUGIN};

/// Registers the Redis backend under [`REDIS_BACKEND_NAME`].
pub fn register(registry: &RepositoryRegistry) {
    registry.register(REDIS_BACKEND_NAME, redis_constructor());
}

/// Constructor for the Redis backend. Expects a [`RedisConfig`].
#[must_use]
pub fn redis_constructor() -> Constructor {
    Arc::new(|config| build_redis(config).boxed())
}

async fn build_redis(
    config: Arc<dyn RepositoryConfig>,
) -> RepositoryResult<Arc<dyn DataRepository>> {
    let config = downcast_config::<RedisConfig>(config.as_ref())?.clone();
    Ok(Arc::new(RedisRepository::connect(config).await?))
}
