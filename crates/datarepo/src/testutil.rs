//! Shared test utilities for repository testing.
//!
//! This module provides helpers for building identifiers and documents,
//! pre-populated repositories, and assertion macros over
//! [`RepositoryResult`] values. It is feature-gated behind `testutil` to
//! prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! datarepo = { path = "../datarepo", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use datarepo::testutil::{make_id, make_document, populated_repository};
//! ```

use serde_json::{Value, json};

use crate::{
    error::{ErrorKind, RepositoryResult},
    identifier::EntityIdentifier,
    memory::MemoryRepository,
    repository::DataRepository,
};

/// Create a deterministic structured identifier from a prefix and index.
///
/// Produces ids like `{prefix, "000042"}` (zero-padded to 6 digits) so that
/// canonical ordering matches numeric ordering.
#[must_use]
pub fn make_id(prefix: &str, idx: usize) -> EntityIdentifier {
    EntityIdentifier::structured(prefix, format!("{idx:06}"))
}

/// Create a small JSON document tagged with an index.
#[must_use]
pub fn make_document(idx: usize) -> Value {
    json!({ "index": idx, "name": format!("entity-{idx}") })
}

/// Create a [`MemoryRepository`] pre-populated with `count` entities under `prefix`.
///
/// # Panics
///
/// Panics if any `create` fails (should not happen with `MemoryRepository`).
pub async fn populated_repository(prefix: &str, count: usize) -> MemoryRepository {
    let repo = MemoryRepository::new();
    for i in 0..count {
        repo.create(&make_id(prefix, i), make_document(i)).await.expect("populate create failed");
    }
    repo
}

/// Returns the [`ErrorKind`] of a failed result, or `None` on success.
pub fn error_kind<T>(result: &RepositoryResult<T>) -> Option<ErrorKind> {
    result.as_ref().err().map(crate::RepositoryError::kind)
}

/// Assert that a [`RepositoryResult`] failed with the given [`ErrorKind`] variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use datarepo::{assert_error_kind, RepositoryError, RepositoryResult};
///
/// let result: RepositoryResult<()> = Err(RepositoryError::invalid_input("bad"));
/// assert_error_kind!(result, InvalidInput);
/// ```
#[macro_export]
macro_rules! assert_error_kind {
    ($result:expr, $kind:ident) => {
        match &$result {
            Err(err) => assert_eq!(
                err.kind(),
                $crate::error::ErrorKind::$kind,
                "expected {:?}, got: {:?}",
                $crate::error::ErrorKind::$kind,
                err,
            ),
            Ok(_) => panic!("expected {:?}, got Ok", $crate::error::ErrorKind::$kind),
        }
    };
    ($result:expr, $kind:ident, $msg:expr) => {
        match &$result {
            Err(err) => assert_eq!(
                err.kind(),
                $crate::error::ErrorKind::$kind,
                "{}: expected {:?}, got: {:?}",
                $msg,
                $crate::error::ErrorKind::$kind,
                err,
            ),
            Ok(_) => panic!("{}: expected {:?}, got Ok", $msg, $crate::error::ErrorKind::$kind),
        }
    };
}

/// Assert that a [`RepositoryResult`] is a [`RepositoryError::NotFound`](crate::RepositoryError::NotFound).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use datarepo::{assert_not_found, RepositoryError, RepositoryResult};
///
/// let result: RepositoryResult<()> = Err(RepositoryError::not_found("user:1"));
/// assert_not_found!(result);
/// ```
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        $crate::assert_error_kind!($result, NotFound)
    };
    ($result:expr, $msg:expr) => {
        $crate::assert_error_kind!($result, NotFound, $msg)
    };
}

/// Assert that a [`RepositoryResult`] is `Ok`.
///
/// Returns the inner value on success, panics with a descriptive message
/// on failure.
#[macro_export]
macro_rules! assert_repo_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got RepositoryError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got RepositoryError: {e:?}", $msg),
        }
    };
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::RepositoryError;

    #[test]
    fn test_make_id_ordering() {
        let a = make_id("k", 1);
        let b = make_id("k", 10);
        let c = make_id("k", 100);
        assert_eq!(a.to_string(), "k:000001");
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn test_make_document() {
        assert_eq!(make_document(3)["name"], "entity-3");
    }

    #[tokio::test]
    async fn test_populated_repository() {
        let repo = populated_repository("item", 5).await;
        for i in 0..5 {
            let value = repo.read(&make_id("item", i)).await.expect("read");
            assert_eq!(value["index"], i);
        }
    }

    #[test]
    fn test_assert_error_kind_macro() {
        let result: RepositoryResult<()> = Err(RepositoryError::already_exists("x"));
        assert_error_kind!(result, AlreadyExists);
        assert_eq!(error_kind(&result), Some(ErrorKind::AlreadyExists));
    }

    #[test]
    fn test_assert_not_found_macro() {
        let result: RepositoryResult<()> = Err(RepositoryError::not_found("missing"));
        assert_not_found!(result);
    }

    #[test]
    fn test_assert_repo_ok_macro() {
        let result: RepositoryResult<i32> = Ok(42);
        assert_eq!(error_kind(&result), None);
        assert_eq!(assert_repo_ok!(result), 42);
    }
}
