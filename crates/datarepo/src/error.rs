//! Repository error types and result alias.
//!
//! Every backend maps its internal failures to exactly one [`ErrorKind`].
//! The underlying cause, when there is one, travels in the `source` field so
//! diagnostics can walk the chain without changing the discriminable kind.
//!
//! # Error Kinds
//!
//! - [`RepositoryError::NotFound`] - Entity, lock, or TTL does not exist
//! - [`RepositoryError::AlreadyExists`] - Create on an existing entity
//! - [`RepositoryError::InvalidIdentifier`] - Identifier or pattern failed validation
//! - [`RepositoryError::InvalidInput`] - Bad arguments, config, or stored value type
//! - [`RepositoryError::OperationFailed`] - Connectivity or protocol failure
//! - [`RepositoryError::NotSupported`] - Operation unavailable on this backend
//!
//! # Example
//!
//! ```
//! use datarepo::{ErrorKind, RepositoryError, RepositoryResult};
//!
//! fn lookup(key: &str) -> RepositoryResult<Vec<u8>> {
//!     Err(RepositoryError::not_found(key))
//! }
//!
//! let err = lookup("user:123").unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::NotFound);
//! assert!(err.is_not_found());
//! ```

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// The discriminant of a [`RepositoryError`].
///
/// Callers that only care about the class of failure match on this rather
/// than on the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The entity, lock, or expiry does not exist.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The identifier or identifier pattern is malformed.
    InvalidIdentifier,
    /// An argument, configuration value, or stored value is unusable.
    InvalidInput,
    /// The backend could not complete the operation.
    OperationFailed,
    /// The backend does not support the operation.
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::InvalidIdentifier => "invalid identifier",
            Self::InvalidInput => "invalid input",
            Self::OperationFailed => "operation failed",
            Self::NotSupported => "not supported",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during repository operations.
///
/// This enum is the shared taxonomy for every backend. Backends attach the
/// lower-level cause via the `source` fields; the variant itself never
/// changes because of what is wrapped.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm, or match on [`ErrorKind`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// The requested entity was not found.
    #[error("entity not found: {key}")]
    NotFound {
        /// The key or identifier that was not found.
        key: String,
    },

    /// The entity already exists.
    #[error("entity already exists: {key}")]
    AlreadyExists {
        /// The key or identifier that collided.
        key: String,
    },

    /// The identifier failed validation before reaching the backend.
    #[error("invalid identifier: {message}")]
    InvalidIdentifier {
        /// Description of the validation failure.
        message: String,
        /// The validation error that rejected the identifier.
        #[source]
        source: Option<BoxError>,
    },

    /// Input to the operation was invalid.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid input.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The backend failed to execute the operation.
    ///
    /// Connectivity and protocol failures land here. They are never retried
    /// by the repository itself.
    #[error("operation failed: {message}")]
    OperationFailed {
        /// Description of the failure.
        message: String,
        /// The underlying error that caused the failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation is not supported by this backend.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The name of the unsupported operation.
        operation: String,
    },
}

impl RepositoryError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `AlreadyExists` error for the given key.
    #[must_use]
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Creates a new `InvalidIdentifier` error with the given message.
    #[must_use]
    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::InvalidIdentifier { message: message.into(), source: None }
    }

    /// Creates a new `InvalidIdentifier` error with a message and source error.
    #[must_use]
    pub fn invalid_identifier_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::InvalidIdentifier { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `InvalidInput` error with the given message.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into(), source: None }
    }

    /// Creates a new `InvalidInput` error with a message and source error.
    #[must_use]
    pub fn invalid_input_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::InvalidInput { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `OperationFailed` error with the given message.
    #[must_use]
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed { message: message.into(), source: None }
    }

    /// Creates a new `OperationFailed` error with a message and source error.
    #[must_use]
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::OperationFailed { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `NotSupported` error for the named operation.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported { operation: operation.into() }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidIdentifier { .. } => ErrorKind::InvalidIdentifier,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::OperationFailed { .. } => ErrorKind::OperationFailed,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
        }
    }

    /// Returns `true` if this is a [`NotFound`](Self::NotFound) error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns `true` if this is an [`AlreadyExists`](Self::AlreadyExists) error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Returns `true` if this is an [`InvalidIdentifier`](Self::InvalidIdentifier) error.
    #[must_use]
    pub fn is_invalid_identifier(&self) -> bool {
        self.kind() == ErrorKind::InvalidIdentifier
    }

    /// Returns `true` if this is an [`InvalidInput`](Self::InvalidInput) error.
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        self.kind() == ErrorKind::InvalidInput
    }

    /// Returns `true` if this is an [`OperationFailed`](Self::OperationFailed) error.
    #[must_use]
    pub fn is_operation_failed(&self) -> bool {
        self.kind() == ErrorKind::OperationFailed
    }

    /// Returns the attached cause if it is an `E`.
    ///
    /// Backends attach their internal error as the source; this recovers it
    /// without walking the [`source`](std::error::Error::source) chain.
    #[must_use]
    pub fn downcast_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::InvalidIdentifier { source, .. }
            | Self::InvalidInput { source, .. }
            | Self::OperationFailed { source, .. } => source.as_deref()?.downcast_ref::<E>(),
            Self::NotFound { .. } | Self::AlreadyExists { .. } | Self::NotSupported { .. } => None,
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input_with_source("value could not be (de)serialized", err)
    }
}
