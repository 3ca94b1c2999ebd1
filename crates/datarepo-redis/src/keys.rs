//! Identifier to physical key mapping.
//!
//! Every key the backend sends to Redis is built and checked here. A
//! physical key has the shape
//!
//! ```text
//! <namespace-prefix><sep><entity-prefix><sep><id>     structured identifier
//! <namespace-prefix><sep><token>                      simple identifier
//! ```
//!
//! and must satisfy:
//!
//! | Rule | Error |
//! |------|-------|
//! | length in `[5, 256]` | [`KeyError::InvalidLength`] |
//! | characters from `[A-Za-z0-9_:.-]` (plus `*` and `?` for patterns) | [`KeyError::InvalidChars`] / [`KeyError::InvalidPatternChars`] |
//! | starts with `<namespace-prefix><sep>` | [`KeyError::MissingPrefix`] |
//! | a non-empty part follows the prefix | [`KeyError::MissingSuffix`] |
//! | no empty part between separators | [`KeyError::EmptySegment`] |
//!
//! Identifiers are checked with [`EntityIdentifier::validate`] against the
//! configured separator before a key is assembled.

use datarepo::{EntityIdentifier, IdentifierError, RepositoryError};
use thiserror::Error;

/// Default namespace prefix prepended to every key.
pub const DEFAULT_KEY_PREFIX: &str = "app";

/// Default separator between key parts.
pub const DEFAULT_KEY_SEPARATOR: &str = ":";

/// Shortest accepted physical key.
pub const MIN_KEY_LENGTH: usize = 5;

/// Longest accepted physical key.
pub const MAX_KEY_LENGTH: usize = 256;

const LOCK_SUFFIX: &str = "lock";
const CHANNEL_PART: &str = "channel";

/// Whether wildcards are accepted in a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// A concrete key. Only `[A-Za-z0-9_:.-]`.
    Exact,
    /// A `KEYS` pattern. Additionally allows `*` and `?`.
    Pattern,
}

/// Reasons a key or identifier is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum KeyError {
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
        /// The configured separator.
        separator: String,
    },

    /// The key is shorter or longer than allowed.
    #[error("key length {length} out of allowed range [{min}, {max}]", min = MIN_KEY_LENGTH, max = MAX_KEY_LENGTH)]
    InvalidLength {
        /// Length of the rejected key in bytes.
        length: usize,
    },

    /// The key contains characters outside `[A-Za-z0-9_:.-]`.
    #[error("key {key:?} contains invalid characters")]
    InvalidChars {
        /// The rejected key.
        key: String,
    },

    /// The pattern contains characters outside `[A-Za-z0-9_:.*?-]`.
    #[error("key pattern {key:?} contains invalid characters")]
    InvalidPatternChars {
        /// The rejected pattern.
        key: String,
    },

    /// The key does not start with the namespace prefix.
    #[error("key does not start with {expected:?}")]
    MissingPrefix {
        /// The required leading `<prefix><sep>`.
        expected: String,
    },

    /// Nothing follows the namespace prefix.
    #[error("key must have at least one non-empty part after the prefix")]
    MissingSuffix,

    /// Two separators are adjacent or the key ends with a separator.
    #[error("key contains an empty part")]
    EmptySegment,
}

impl From<IdentifierError> for KeyError {
    fn from(err: IdentifierError) -> Self {
        match err {
            IdentifierError::InvalidEntityPrefix { prefix } => Self::InvalidEntityPrefix { prefix },
            IdentifierError::SeparatorInPart { part, separator } => {
                Self::SeparatorInPart { part, separator }
            },
        }
    }
}

impl From<KeyError> for RepositoryError {
    fn from(err: KeyError) -> Self {
        RepositoryError::invalid_identifier_with_source(err.to_string(), err)
    }
}

fn is_key_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | ':' | '.' | '-')
}

fn is_pattern_char(ch: char) -> bool {
    is_key_char(ch) || matches!(ch, '*' | '?')
}

/// Encodes identifiers into namespaced keys and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
    separator: String,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX, DEFAULT_KEY_SEPARATOR)
    }
}

impl KeyCodec {
    /// Creates a codec for the given namespace prefix and separator.
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), separator: separator.into() }
    }

    /// Returns the namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the separator.
    #[must_use]
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Builds the physical key for `id`.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the entity prefix is malformed, a part
    /// contains the separator, or the assembled key fails
    /// [`validate_key`](Self::validate_key).
    pub fn encode(&self, id: &EntityIdentifier, mode: KeyMode) -> Result<String, KeyError> {
        id.validate(&self.separator)?;

        let mut key = self.prefix.clone();
        for part in id.parts() {
            key.push_str(&self.separator);
            key.push_str(part);
        }
        self.validate_key(&key, mode)?;
        Ok(key)
    }

    /// Reconstructs the identifier a physical key was built from.
    ///
    /// Two or more parts after the namespace prefix yield a structured
    /// identifier from the first two; a single part yields a simple one.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if `key` is not a valid exact key.
    pub fn decode(&self, key: &str) -> Result<EntityIdentifier, KeyError> {
        self.validate_key(key, KeyMode::Exact)?;

        let rest = key
            .strip_prefix(self.namespace().as_str())
            .ok_or_else(|| KeyError::MissingPrefix { expected: self.namespace() })?;
        let parts: Vec<&str> = rest.split(self.separator.as_str()).collect();
        match parts.as_slice() {
            [prefix, id, ..] => Ok(EntityIdentifier::structured(*prefix, *id)),
            _ => Ok(EntityIdentifier::simple(rest)),
        }
    }

    /// Checks a physical key or pattern against the key rules.
    ///
    /// Checks run in a fixed order and the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the [`KeyError`] of the first rule `key` breaks.
    pub fn validate_key(&self, key: &str, mode: KeyMode) -> Result<(), KeyError> {
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&key.len()) {
            return Err(KeyError::InvalidLength { length: key.len() });
        }

        match mode {
            KeyMode::Exact if !key.chars().all(is_key_char) => {
                return Err(KeyError::InvalidChars { key: key.to_owned() });
            },
            KeyMode::Pattern if !key.chars().all(is_pattern_char) => {
                return Err(KeyError::InvalidPatternChars { key: key.to_owned() });
            },
            _ => {},
        }

        let namespace = self.namespace();
        if !key.starts_with(&namespace) {
            return Err(KeyError::MissingPrefix { expected: namespace });
        }

        let parts: Vec<&str> = key.split(self.separator.as_str()).collect();
        if parts.get(1).map_or(true, |part| part.is_empty()) {
            return Err(KeyError::MissingSuffix);
        }
        if parts.iter().any(|part| part.is_empty()) {
            return Err(KeyError::EmptySegment);
        }
        Ok(())
    }

    /// Returns the lock record key guarding `key`.
    #[must_use]
    pub fn lock_key(&self, key: &str) -> String {
        format!("{key}{}{LOCK_SUFFIX}", self.separator)
    }

    /// Returns the wire channel name for the logical channel `name`.
    #[must_use]
    pub fn channel_name(&self, name: &str) -> String {
        format!("{}{CHANNEL_PART}{}{name}", self.namespace(), self.separator)
    }

    fn namespace(&self) -> String {
        format!("{}{}", self.prefix, self.separator)
    }
}
