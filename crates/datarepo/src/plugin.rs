//! Plugin extension point.
//!
//! A [`RepositoryPlugin`] is a named, backend-specific capability that a
//! repository instance carries alongside the common contract. Plugins are
//! looked up by name through [`DataRepository::get_plugin`](crate::DataRepository::get_plugin);
//! what `execute` does with its command and arguments is entirely up to the
//! plugin.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::RepositoryResult;

/// A named capability attached to a repository instance.
#[async_trait]
pub trait RepositoryPlugin: Send + Sync + fmt::Debug {
    /// The unique name the plugin is registered under.
    fn name(&self) -> &str;

    /// Executes a plugin command with JSON arguments.
    async fn execute(&self, command: &str, args: &[Value]) -> RepositoryResult<Value>;
}

/// Per-instance table of registered plugins.
///
/// Registration never fails; a plugin registered under an existing name
/// replaces the previous one. Clones share the same table.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<HashMap<String, Arc<dyn RepositoryPlugin>>>>,
}

impl PluginRegistry {
    /// Creates an empty plugin table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its own name.
    pub fn register(&self, plugin: Arc<dyn RepositoryPlugin>) {
        let name = plugin.name().to_owned();
        tracing::debug!(plugin = %name, "registering repository plugin");
        self.plugins.write().insert(name, plugin);
    }

    /// Looks up a plugin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn RepositoryPlugin>> {
        self.plugins.read().get(name).cloned()
    }

    /// Returns the registered plugin names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.names()).finish()
    }
}
