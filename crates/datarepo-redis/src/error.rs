//! Error types for the Redis backend.
//!
//! This module maps `redis` client failures and key codec failures onto the
//! generic [`RepositoryError`] taxonomy.

use datarepo::RepositoryError;
use redis::RedisError;
use thiserror::Error;

use crate::keys::KeyError;

/// Result type alias for Redis backend internals.
pub type Result<T> = std::result::Result<T, RedisRepositoryError>;

/// Errors specific to the Redis backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RedisRepositoryError {
    /// Error returned by the Redis client or server.
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),

    /// The identifier could not be mapped to a key.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// The stored value is not an integer counter.
    #[error("value at {key} is not an integer counter")]
    NotAnInteger {
        /// Physical key that was incremented.
        key: String,
        /// The server's type error.
        #[source]
        source: RedisError,
    },

    /// The connection descriptor could not be parsed.
    #[error("invalid connection descriptor: {0}")]
    Descriptor(String),

    /// The server replied with a shape the backend does not understand.
    #[error("unexpected reply to {command}: {detail}")]
    UnexpectedReply {
        /// Command that produced the reply.
        command: &'static str,
        /// What was wrong with it.
        detail: String,
    },
}

impl RedisRepositoryError {
    /// Maps an `INCR` failure, separating type errors from connectivity errors.
    pub(crate) fn from_increment(key: &str, source: RedisError) -> Self {
        if is_type_error(&source) {
            Self::NotAnInteger { key: key.to_owned(), source }
        } else {
            Self::Redis(source)
        }
    }
}

/// Returns `true` for server errors caused by the stored value's type.
fn is_type_error(err: &RedisError) -> bool {
    err.code() == Some("WRONGTYPE")
        || err.detail().is_some_and(|detail| {
            detail.contains("wrong kind of value") || detail.contains("not an integer")
        })
}

impl From<RedisRepositoryError> for RepositoryError {
    fn from(err: RedisRepositoryError) -> Self {
        match err {
            RedisRepositoryError::Redis(source) => {
                RepositoryError::operation_failed_with_source(source.to_string(), source)
            },
            RedisRepositoryError::Key(source) => source.into(),
            err @ RedisRepositoryError::NotAnInteger { .. } => {
                RepositoryError::invalid_input_with_source(err.to_string(), err)
            },
            RedisRepositoryError::Descriptor(message) => RepositoryError::invalid_input(message),
            err @ RedisRepositoryError::UnexpectedReply { .. } => {
                RepositoryError::operation_failed(err.to_string())
            },
        }
    }
}
