//! Backend configuration.
//!
//! [`RepositoryConfig`] is the opaque configuration handed to a registry
//! constructor. Each backend downcasts it to its own concrete type through
//! [`as_any`](RepositoryConfig::as_any) and rejects anything else.

use std::{any::Any, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, RepositoryResult};

/// Default interval between background expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-subscriber message buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

/// Connection string reported by [`MemoryConfig`].
pub const MEMORY_CONNECTION_STRING: &str = "memory://";

/// Configuration accepted by [`RepositoryRegistry`](crate::RepositoryRegistry) constructors.
pub trait RepositoryConfig: Send + Sync + fmt::Debug + 'static {
    /// Returns the backend connection string.
    fn connection_string(&self) -> String;

    /// Exposes the concrete type for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Downcasts an opaque config to the type a backend expects.
///
/// # Errors
///
/// Returns [`RepositoryError::InvalidInput`] if `config` is not a `T`.
pub fn downcast_config<T: RepositoryConfig>(config: &dyn RepositoryConfig) -> RepositoryResult<&T> {
    config.as_any().downcast_ref::<T>().ok_or_else(|| {
        RepositoryError::invalid_input(format!(
            "invalid config type: expected {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Configuration for [`MemoryRepository`](crate::MemoryRepository).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use datarepo::MemoryConfig;
///
/// let config = MemoryConfig::builder().sweep_interval(Duration::from_secs(5)).build();
/// assert_eq!(config.sweep_interval(), Duration::from_secs(5));
/// assert_eq!(config.subscriber_buffer(), 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// How often the background sweep evicts expired entries.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    #[builder(default = DEFAULT_SWEEP_INTERVAL)]
    pub(crate) sweep_interval: Duration,

    /// Capacity of each subscriber's message buffer.
    #[serde(default = "default_subscriber_buffer")]
    #[builder(default = DEFAULT_SUBSCRIBER_BUFFER)]
    pub(crate) subscriber_buffer: usize,
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MemoryConfig {
    /// Returns the sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Returns the subscriber buffer capacity.
    #[must_use]
    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }

    /// Checks that the values can drive a repository.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidInput`] if the sweep interval or
    /// subscriber buffer is zero.
    pub fn validate(&self) -> RepositoryResult<()> {
        if self.sweep_interval.is_zero() {
            return Err(RepositoryError::invalid_input("sweep_interval must be non-zero"));
        }
        if self.subscriber_buffer == 0 {
            return Err(RepositoryError::invalid_input("subscriber_buffer must be non-zero"));
        }
        Ok(())
    }
}

impl RepositoryConfig for MemoryConfig {
    fn connection_string(&self) -> String {
        MEMORY_CONNECTION_STRING.to_owned()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct OtherConfig;

    impl RepositoryConfig for OtherConfig {
        fn connection_string(&self) -> String {
            "other://".into()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_builder_defaults_match_default_impl() {
        let config = MemoryConfig::default();
        assert_eq!(config.sweep_interval(), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(config.subscriber_buffer(), DEFAULT_SUBSCRIBER_BUFFER);
        assert_eq!(config.connection_string(), "memory://");
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: MemoryConfig =
            serde_json::from_str(r#"{"sweep_interval":"250ms","subscriber_buffer":8}"#).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
        assert_eq!(config.subscriber_buffer(), 8);

        let config: MemoryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MemoryConfig::default());
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result = serde_json::from_str::<MemoryConfig>(r#"{"sweep":"1s"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = MemoryConfig::builder().sweep_interval(Duration::ZERO).build();
        assert!(config.validate().unwrap_err().is_invalid_input());

        let config = MemoryConfig::builder().subscriber_buffer(0).build();
        assert!(config.validate().unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_downcast_config() {
        let memory = MemoryConfig::default();
        assert!(downcast_config::<MemoryConfig>(&memory).is_ok());

        let err = downcast_config::<MemoryConfig>(&OtherConfig).unwrap_err();
        assert!(err.is_invalid_input());
    }
}
