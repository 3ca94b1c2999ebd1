//! Name-keyed repository factory.
//!
//! [`RepositoryRegistry`] maps a backend name to an async constructor. It is
//! an ordinary value owned by the application, so tests and services can
//! each hold their own registry with exactly the backends they need.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use datarepo::{MemoryConfig, RepositoryRegistry};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let registry = RepositoryRegistry::with_defaults();
//! let repo = registry.create("memory", Arc::new(MemoryConfig::default())).await.unwrap();
//! assert_eq!(repo.backend_name(), "memory");
//! # });
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::RwLock;

use crate::{
    config::{MemoryConfig, RepositoryConfig, downcast_config},
    error::{RepositoryError, RepositoryResult},
    memory::{MEMORY_BACKEND_NAME, MemoryRepository},
    repository::DataRepository,
};

/// An async constructor producing a repository from an opaque configuration.
pub type Constructor = Arc<
    dyn Fn(Arc<dyn RepositoryConfig>) -> BoxFuture<'static, RepositoryResult<Arc<dyn DataRepository>>>
        + Send
        + Sync,
>;

/// Registry of backend constructors keyed by name.
///
/// Registration and lookup are safe to call concurrently. Registering an
/// existing name replaces its constructor.
#[derive(Clone, Default)]
pub struct RepositoryRegistry {
    constructors: Arc<RwLock<HashMap<String, Constructor>>>,
}

impl RepositoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the in-memory backend registered as `"memory"`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(MEMORY_BACKEND_NAME, memory_constructor());
        registry
    }

    /// Registers `constructor` under `name`, replacing any existing entry.
    pub fn register(&self, name: impl Into<String>, constructor: Constructor) {
        let name = name.into();
        tracing::debug!(backend = %name, "registering repository constructor");
        self.constructors.write().insert(name, constructor);
    }

    /// Registers a constructor from a plain async function or closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Arc<dyn RepositoryConfig>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = RepositoryResult<Arc<dyn DataRepository>>>
            + Send
            + 'static,
    {
        self.register(name, Arc::new(move |config| constructor(config).boxed()));
    }

    /// Constructs the backend registered under `name`.
    ///
    /// # Errors
    ///
    /// - [`OperationFailed`](RepositoryError::OperationFailed) if no backend is
    ///   registered under `name`
    /// - Whatever the constructor returns, typically
    ///   [`InvalidInput`](RepositoryError::InvalidInput) for a config of the wrong type
    #[tracing::instrument(name = "create_repository", skip(self, config), fields(backend = %name))]
    pub async fn create(
        &self,
        name: &str,
        config: Arc<dyn RepositoryConfig>,
    ) -> RepositoryResult<Arc<dyn DataRepository>> {
        // Clone out so the lock is not held across the constructor's await.
        let constructor = self.constructors.read().get(name).cloned();
        let Some(constructor) = constructor else {
            return Err(RepositoryError::operation_failed(format!(
                "unknown repository type: {name}"
            )));
        };
        constructor(config).await
    }

    /// Returns `true` if a backend is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Returns the registered backend names, sorted.
    #[must_use]
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryRegistry").field("backends", &self.registered_names()).finish()
    }
}

/// Constructor for the in-memory backend. Expects a [`MemoryConfig`].
#[must_use]
pub fn memory_constructor() -> Constructor {
    Arc::new(|config| build_memory(config).boxed())
}

async fn build_memory(
    config: Arc<dyn RepositoryConfig>,
) -> RepositoryResult<Arc<dyn DataRepository>> {
    let config = downcast_config::<MemoryConfig>(config.as_ref())?.clone();
    Ok(Arc::new(MemoryRepository::try_with_config(config)?))
}
