//! Entity identifiers.
//!
//! An [`EntityIdentifier`] names one entity independently of the backend
//! that stores it. Its [`Display`](std::fmt::Display) output is the
//! canonical string: the in-process backend uses it directly as a map key,
//! while networked backends feed the identifier's parts through their own
//! key codec.
//!
//! Both paths run [`EntityIdentifier::validate`] first, so two distinct
//! identifiers can never map to the same key:
//!
//! | Rule | Error |
//! |------|-------|
//! | entity prefix matches `[A-Za-z][A-Za-z0-9_-]*` | [`IdentifierError::InvalidEntityPrefix`] |
//! | no part contains the separator | [`IdentifierError::SeparatorInPart`] |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RepositoryError;

/// Separator used in the canonical string of a structured identifier.
pub const CANONICAL_SEPARATOR: &str = ":";

/// Reasons an identifier cannot be mapped to a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The entity prefix does not start with a letter or has invalid characters.
    #[error(
        "invalid entity prefix {prefix:?}: must start with a letter and contain only letters, \
         digits, underscores, and hyphens"
    )]
    InvalidEntityPrefix {
        /// The rejected entity prefix.
        prefix: String,
    },

    /// An identifier part contains the key separator.
    #[error("identifier part {part:?} contains the key separator {separator:?}")]
    SeparatorInPart {
        /// The offending part.
        part: String,
        /// The separator the backend joins parts with.
        separator: String,
    },
}

impl From<IdentifierError> for RepositoryError {
    fn from(err: IdentifierError) -> Self {
        RepositoryError::invalid_identifier_with_source(err.to_string(), err)
    }
}

/// Returns `true` if `prefix` is a valid entity prefix.
#[must_use]
pub fn is_valid_entity_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}

/// A unique identifier for an entity.
///
/// # Examples
///
/// ```
/// use datarepo::EntityIdentifier;
///
/// let user = EntityIdentifier::structured("user", "123");
/// assert_eq!(user.to_string(), "user:123");
///
/// let token = EntityIdentifier::simple("settings");
/// assert_eq!(token.to_string(), "settings");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityIdentifier {
    /// A single opaque token.
    Simple(String),

    /// An entity-prefix and id pair, canonically `prefix:id`.
    Structured {
        /// Entity type prefix (for example `user`).
        prefix: String,
        /// Entity id within the prefix.
        id: String,
    },
}

impl EntityIdentifier {
    /// Creates a simple identifier from a single token.
    #[must_use]
    pub fn simple(token: impl Into<String>) -> Self {
        Self::Simple(token.into())
    }

    /// Creates a structured identifier from an entity prefix and id.
    #[must_use]
    pub fn structured(prefix: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Structured { prefix: prefix.into(), id: id.into() }
    }

    /// Returns the entity prefix for structured identifiers.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        match self {
            Self::Simple(_) => None,
            Self::Structured { prefix, .. } => Some(prefix),
        }
    }

    /// Returns the identifier's parts in key order.
    #[must_use]
    pub fn parts(&self) -> Vec<&str> {
        match self {
            Self::Simple(token) => vec![token.as_str()],
            Self::Structured { prefix, id } => vec![prefix.as_str(), id.as_str()],
        }
    }

    /// Returns the canonical string of this identifier.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Checks that this identifier maps to exactly one key when its parts
    /// are joined with `separator`.
    ///
    /// Wildcards are not checked here; they are only meaningful to the
    /// backend's pattern matcher.
    ///
    /// # Errors
    ///
    /// - [`IdentifierError::InvalidEntityPrefix`] if a structured
    ///   identifier's prefix is malformed
    /// - [`IdentifierError::SeparatorInPart`] if any part contains `separator`
    ///
    /// # Examples
    ///
    /// ```
    /// use datarepo::{EntityIdentifier, IdentifierError};
    ///
    /// assert!(EntityIdentifier::structured("user", "42").validate(":").is_ok());
    /// assert!(matches!(
    ///     EntityIdentifier::structured("user", "1:x").validate(":"),
    ///     Err(IdentifierError::SeparatorInPart { .. })
    /// ));
    /// ```
    pub fn validate(&self, separator: &str) -> Result<(), IdentifierError> {
        if let Self::Structured { prefix, .. } = self {
            if !is_valid_entity_prefix(prefix) {
                return Err(IdentifierError::InvalidEntityPrefix { prefix: prefix.clone() });
            }
        }
        if separator.is_empty() {
            return Ok(());
        }
        match self.parts().into_iter().find(|part| part.contains(separator)) {
            Some(part) => Err(IdentifierError::SeparatorInPart {
                part: part.to_owned(),
                separator: separator.to_owned(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for EntityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(token) => f.write_str(token),
            Self::Structured { prefix, id } => write!(f, "{prefix}{CANONICAL_SEPARATOR}{id}"),
        }
    }
}

impl From<&str> for EntityIdentifier {
    fn from(token: &str) -> Self {
        Self::simple(token)
    }
}

impl From<String> for EntityIdentifier {
    fn from(token: String) -> Self {
        Self::Simple(token)
    }
}

impl From<(&str, &str)> for EntityIdentifier {
    fn from((prefix, id): (&str, &str)) -> Self {
        Self::structured(prefix, id)
    }
}
