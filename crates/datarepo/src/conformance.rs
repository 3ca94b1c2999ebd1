//! Conformance test suite for [`DataRepository`] implementations.
//!
//! This module provides async test functions that check whether a
//! [`DataRepository`] implementation satisfies the shared contract. Every
//! backend runs the same suite, so callers can swap engines without
//! observing a difference.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each conformance function with
//! a repository instance:
//!
//! ```no_run
//! use datarepo::{conformance, MemoryRepository};
//!
//! #[tokio::test]
//! async fn crud_create_then_read() {
//!     conformance::crud_create_then_read(&MemoryRepository::new()).await;
//! }
//! ```
//!
//! Every function uses its own identifiers and clears them first, so the
//! whole suite can share one repository, including a long-lived server.
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | create/read/update/upsert/delete and their NotFound/AlreadyExists rules |
//! | Identifiers | InvalidIdentifier for identifiers that could share a key |
//! | List | pattern matching and the end-to-end scenario |
//! | Search | local validation of paging |
//! | Locks | exclusive acquisition, expiry, release |
//! | Expiration | TTL set/get and expiry visibility |
//! | Counters | sequential and concurrent increments |
//! | Pub/sub | fan-out and cancellation |
//! | Lifecycle | ping, plugins, close |

use std::{collections::HashSet, sync::Arc, time::Duration};

use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    assert_error_kind, assert_not_found,
    identifier::EntityIdentifier,
    repository::{DataRepository, SearchQuery},
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn id(prefix: &str, name: &str) -> EntityIdentifier {
    EntityIdentifier::structured(prefix, name)
}

/// Deletes leftovers from an earlier run against a shared server.
async fn clear<R: DataRepository + ?Sized>(repo: &R, ids: &[&EntityIdentifier]) {
    for id in ids {
        let _ = repo.delete(id).await;
        let _ = repo.release_lock(id).await;
    }
}

// ============================================================================
// CRUD
// ============================================================================

/// `create` then `read` returns the stored document.
pub async fn crud_create_then_read<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcrud", "create-read");
    clear(repo, &[&key]).await;

    repo.create(&key, json!({"name": "Ada"})).await.expect("create should succeed");
    let value = repo.read(&key).await.expect("read should succeed");
    assert_eq!(value, json!({"name": "Ada"}));
}

/// A second `create` on the same identifier fails with AlreadyExists.
pub async fn crud_create_twice_already_exists<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcrud", "create-twice");
    clear(repo, &[&key]).await;

    repo.create(&key, json!(1)).await.expect("first create");
    let result = repo.create(&key, json!(2)).await;
    assert_error_kind!(result, AlreadyExists, "second create must be rejected");
    assert_eq!(repo.read(&key).await.expect("read"), json!(1), "original value must survive");
}

/// `read`, `update` and `delete` on a never-created identifier return NotFound.
pub async fn crud_missing_entity_not_found<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcrud", "never-created");
    clear(repo, &[&key]).await;

    assert_not_found!(repo.read(&key).await, "read");
    assert_not_found!(repo.update(&key, json!(1)).await, "update");
    assert_not_found!(repo.delete(&key).await, "delete");
}

/// `update` fully replaces the document.
pub async fn crud_update_overwrites<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcrud", "update");
    clear(repo, &[&key]).await;

    repo.create(&key, json!({"a": 1, "b": 2})).await.expect("create");
    repo.update(&key, json!({"a": 3})).await.expect("update");
    assert_eq!(repo.read(&key).await.expect("read"), json!({"a": 3}), "update is not a merge");
}

/// `upsert` creates when absent and overwrites when present.
pub async fn crud_upsert_creates_and_overwrites<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcrud", "upsert");
    clear(repo, &[&key]).await;

    repo.upsert(&key, json!("first")).await.expect("upsert create");
    assert_eq!(repo.read(&key).await.expect("read"), json!("first"));
    repo.upsert(&key, json!("second")).await.expect("upsert overwrite");
    assert_eq!(repo.read(&key).await.expect("read"), json!("second"));
}

/// `delete` removes the entity and a second delete is NotFound.
pub async fn crud_delete_removes<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcrud", "delete");
    clear(repo, &[&key]).await;

    repo.create(&key, json!(true)).await.expect("create");
    repo.delete(&key).await.expect("delete");
    assert_not_found!(repo.read(&key).await, "read after delete");
    assert_not_found!(repo.delete(&key).await, "second delete");
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifiers that could share a key with another identifier are rejected
/// before any storage access.
pub async fn identifier_ambiguous_parts_invalid<R: DataRepository + ?Sized>(repo: &R) {
    let cases = [
        // These two join to the same key.
        id("confid", "1:x"),
        id("confid:1", "x"),
        id("9confid", "1"),
        id("", "1"),
        EntityIdentifier::simple("confid:2"),
    ];
    for key in &cases {
        let create = repo.create(key, json!(1)).await;
        assert_error_kind!(create, InvalidIdentifier, format!("create {key}"));
        assert_error_kind!(repo.read(key).await, InvalidIdentifier, format!("read {key}"));
        let upsert = repo.upsert(key, json!(1)).await;
        assert_error_kind!(upsert, InvalidIdentifier, format!("upsert {key}"));
        assert_error_kind!(repo.delete(key).await, InvalidIdentifier, format!("delete {key}"));
        let lock = repo.acquire_lock(key, Duration::from_secs(1)).await;
        assert_error_kind!(lock, InvalidIdentifier, format!("acquire_lock {key}"));
        let increment = repo.atomic_increment(key).await;
        assert_error_kind!(increment, InvalidIdentifier, format!("increment {key}"));
    }
}

// ============================================================================
// List
// ============================================================================

/// Create, read, list, delete, read: the canonical end-to-end scenario.
pub async fn list_end_to_end<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confuser", "123");
    clear(repo, &[&key]).await;

    repo.create(&key, json!({"name": "Ada"})).await.expect("create");
    assert_eq!(repo.read(&key).await.expect("read"), json!({"name": "Ada"}));

    let entries = repo.list(&id("confuser", "*")).await.expect("list");
    let entry = entries
        .iter()
        .find(|entry| entry.identifier == key)
        .expect("listing should include the created entity");
    assert_eq!(entry.value, json!({"name": "Ada"}));

    repo.delete(&key).await.expect("delete");
    assert_not_found!(repo.read(&key).await);
}

/// `list` only returns entities matching the pattern, sorted by identifier.
pub async fn list_matches_pattern<R: DataRepository + ?Sized>(repo: &R) {
    let a = id("conflista", "1");
    let b = id("conflista", "2");
    let other = id("conflistb", "1");
    clear(repo, &[&a, &b, &other]).await;

    repo.create(&b, json!("b")).await.expect("create b");
    repo.create(&a, json!("a")).await.expect("create a");
    repo.create(&other, json!("other")).await.expect("create other");

    let entries = repo.list(&id("conflista", "*")).await.expect("list");
    let ids: Vec<_> = entries.iter().map(|entry| entry.identifier.clone()).collect();
    assert_eq!(ids, vec![a.clone(), b.clone()], "only matching entities, in identifier order");

    let entries = repo.list(&id("conflista", "?")).await.expect("list single-char");
    assert_eq!(entries.len(), 2);

    clear(repo, &[&a, &b, &other]).await;
}

/// Deleted entities disappear from listings.
pub async fn list_excludes_deleted<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("conflistdel", "gone");
    clear(repo, &[&key]).await;

    repo.create(&key, json!(1)).await.expect("create");
    repo.delete(&key).await.expect("delete");
    let entries = repo.list(&id("conflistdel", "*")).await.expect("list");
    assert!(entries.is_empty(), "deleted entity must not be listed: {entries:?}");
}

// ============================================================================
// Search
// ============================================================================

/// Negative offset or limit is rejected locally with InvalidInput.
pub async fn search_rejects_negative_paging<R: DataRepository + ?Sized>(repo: &R) {
    let result = repo.search(&SearchQuery::builder().query("*").offset(-1).build()).await;
    assert_error_kind!(result, InvalidInput, "negative offset");

    let result = repo.search(&SearchQuery::builder().query("*").limit(-1).build()).await;
    assert_error_kind!(result, InvalidInput, "negative limit");
}

// ============================================================================
// Locks
// ============================================================================

/// A lock is exclusive until released.
pub async fn lock_exclusive_until_released<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("conflock", "release");
    clear(repo, &[&key]).await;

    assert!(repo.acquire_lock(&key, Duration::from_secs(30)).await.expect("acquire"));
    assert!(
        !repo.acquire_lock(&key, Duration::from_secs(30)).await.expect("second acquire"),
        "a held lock must not be granted twice"
    );
    repo.release_lock(&key).await.expect("release");
    assert!(repo.acquire_lock(&key, Duration::from_secs(30)).await.expect("reacquire"));
    repo.release_lock(&key).await.expect("final release");
}

/// A lock becomes free once its TTL elapses.
pub async fn lock_expires_after_ttl<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("conflock", "expire");
    clear(repo, &[&key]).await;

    assert!(repo.acquire_lock(&key, Duration::from_millis(100)).await.expect("acquire"));
    assert!(!repo.acquire_lock(&key, Duration::from_millis(100)).await.expect("before ttl"));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(
        repo.acquire_lock(&key, Duration::from_millis(100)).await.expect("after ttl"),
        "an expired lock must be acquirable"
    );
}

/// Releasing a lock that is not held is NotFound.
pub async fn lock_release_unheld_not_found<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("conflock", "unheld");
    clear(repo, &[&key]).await;

    assert_not_found!(repo.release_lock(&key).await);
}

/// A zero lock TTL is rejected with InvalidInput.
pub async fn lock_zero_ttl_invalid<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("conflock", "zero");
    assert_error_kind!(repo.acquire_lock(&key, Duration::ZERO).await, InvalidInput);
}

// ============================================================================
// Expiration
// ============================================================================

/// An entity with an elapsed TTL reads as NotFound and has no expiration.
pub async fn expiration_elapsed_is_not_found<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confttl", "elapsed");
    clear(repo, &[&key]).await;

    repo.create(&key, json!("short-lived")).await.expect("create");
    repo.set_expiration(&key, Duration::from_millis(100)).await.expect("set_expiration");
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_not_found!(repo.read(&key).await, "read after ttl");
    assert_not_found!(repo.get_expiration(&key).await, "get_expiration after ttl");
}

/// `get_expiration` reports the remaining TTL, bounded by what was set.
pub async fn expiration_reports_remaining<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confttl", "remaining");
    clear(repo, &[&key]).await;

    repo.create(&key, json!(1)).await.expect("create");
    repo.set_expiration(&key, Duration::from_secs(60)).await.expect("set_expiration");
    let remaining = repo.get_expiration(&key).await.expect("get_expiration");
    assert!(remaining <= Duration::from_secs(60), "remaining {remaining:?} exceeds ttl");
    assert!(remaining > Duration::from_secs(50), "remaining {remaining:?} is too small");

    repo.delete(&key).await.expect("cleanup");
}

/// Without a TTL `get_expiration` is NotFound; setting one on a missing entity is NotFound.
pub async fn expiration_absent_not_found<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confttl", "none");
    let missing = id("confttl", "missing");
    clear(repo, &[&key, &missing]).await;

    repo.create(&key, json!(1)).await.expect("create");
    assert_not_found!(repo.get_expiration(&key).await, "no ttl set");
    assert_not_found!(repo.set_expiration(&missing, Duration::from_secs(1)).await, "missing entity");

    repo.delete(&key).await.expect("cleanup");
}

// ============================================================================
// Counters
// ============================================================================

/// N sequential increments return 1..=N.
pub async fn increment_sequential<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcounter", "sequential");
    clear(repo, &[&key]).await;

    for expected in 1..=10 {
        let value = repo.atomic_increment(&key).await.expect("increment");
        assert_eq!(value, expected);
    }
}

/// Incrementing a JSON document is InvalidInput.
pub async fn increment_document_invalid<R: DataRepository + ?Sized>(repo: &R) {
    let key = id("confcounter", "document");
    clear(repo, &[&key]).await;

    repo.create(&key, json!({"count": 1})).await.expect("create");
    assert_error_kind!(repo.atomic_increment(&key).await, InvalidInput);
    repo.delete(&key).await.expect("cleanup");
}

/// K concurrent increments yield K distinct values ending at K.
pub async fn increment_concurrent<R: DataRepository + ?Sized + 'static>(repo: Arc<R>) {
    const TASKS: i64 = 16;
    let key = id("confcounter", "concurrent");
    clear(repo.as_ref(), &[&key]).await;

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let repo = Arc::clone(&repo);
        let key = key.clone();
        handles.push(tokio::spawn(async move { repo.atomic_increment(&key).await }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let value = handle.await.expect("task panicked").expect("increment");
        assert!(seen.insert(value), "duplicate counter value {value}");
    }
    assert_eq!(seen, (1..=TASKS).collect::<HashSet<_>>());
}

// ============================================================================
// Pub/sub
// ============================================================================

/// Every subscriber registered before a publish receives the message.
pub async fn pubsub_fan_out<R: DataRepository + ?Sized>(repo: &R) {
    let channel = "conformance-fanout";
    let token = CancellationToken::new();
    let mut first = repo.subscribe(channel, token.clone()).await.expect("subscribe first");
    let mut second = repo.subscribe(channel, token.clone()).await.expect("subscribe second");

    repo.publish(channel, Bytes::from_static(b"hello")).await.expect("publish");

    for subscription in [&mut first, &mut second] {
        let message = tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
            .await
            .expect("message should arrive before timeout");
        assert_eq!(message, Some(Bytes::from_static(b"hello")));
    }
    token.cancel();
}

/// A subscriber cancelled before a publish receives nothing.
pub async fn pubsub_cancelled_receives_nothing<R: DataRepository + ?Sized>(repo: &R) {
    let channel = "conformance-cancelled";
    let token = CancellationToken::new();
    let mut subscription = repo.subscribe(channel, token.clone()).await.expect("subscribe");

    token.cancel();
    // Published before the backend has had a chance to release its sink.
    repo.publish(channel, Bytes::from_static(b"after-cancel")).await.expect("publish");
    let ended = tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("cancelled subscription should end before timeout");
    assert_eq!(ended, None, "cancelled subscription must not yield messages");

    repo.publish(channel, Bytes::from_static(b"late")).await.expect("publish");
    assert_eq!(subscription.recv().await, None, "no message after cancellation");
}

/// Publishing to a channel without subscribers succeeds.
pub async fn pubsub_publish_without_subscribers<R: DataRepository + ?Sized>(repo: &R) {
    repo.publish("conformance-empty", Bytes::from_static(b"void"))
        .await
        .expect("publish without subscribers should succeed");
}

// ============================================================================
// Lifecycle
// ============================================================================

/// `ping` succeeds on a healthy backend.
pub async fn ping_succeeds<R: DataRepository + ?Sized>(repo: &R) {
    repo.ping().await.expect("ping should succeed");
}

/// Unknown plugin names resolve to `None`.
pub async fn plugin_lookup_missing_is_none<R: DataRepository + ?Sized>(repo: &R) {
    assert!(repo.get_plugin("conformance.missing").is_none());
}

/// `close` ends live subscriptions and is idempotent.
///
/// The repository is unusable for pub/sub afterwards, so run this last.
pub async fn close_ends_subscriptions<R: DataRepository + ?Sized>(repo: &R) {
    let mut subscription = repo
        .subscribe("conformance-close", CancellationToken::new())
        .await
        .expect("subscribe");

    repo.close().await.expect("close");
    let ended = tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("subscription should end after close");
    assert_eq!(ended, None);

    repo.close().await.expect("second close should be harmless");
}

// ============================================================================
// Convenience runner: run all conformance tests against a single repository
// ============================================================================

/// Run the full conformance suite against the given repository.
///
/// The suite finishes with [`close_ends_subscriptions`], so the repository is
/// closed when this returns.
///
/// ```no_run
/// use std::sync::Arc;
/// use datarepo::{conformance, MemoryRepository};
///
/// #[tokio::test]
/// async fn memory_repository_conformance() {
///     conformance::run_all(Arc::new(MemoryRepository::new())).await;
/// }
/// ```
pub async fn run_all<R: DataRepository + ?Sized + 'static>(repo: Arc<R>) {
    // CRUD
    crud_create_then_read(repo.as_ref()).await;
    crud_create_twice_already_exists(repo.as_ref()).await;
    crud_missing_entity_not_found(repo.as_ref()).await;
    crud_update_overwrites(repo.as_ref()).await;
    crud_upsert_creates_and_overwrites(repo.as_ref()).await;
    crud_delete_removes(repo.as_ref()).await;

    // Identifiers
    identifier_ambiguous_parts_invalid(repo.as_ref()).await;

    // List
    list_end_to_end(repo.as_ref()).await;
    list_matches_pattern(repo.as_ref()).await;
    list_excludes_deleted(repo.as_ref()).await;

    // Search
    search_rejects_negative_paging(repo.as_ref()).await;

    // Locks
    lock_exclusive_until_released(repo.as_ref()).await;
    lock_expires_after_ttl(repo.as_ref()).await;
    lock_release_unheld_not_found(repo.as_ref()).await;
    lock_zero_ttl_invalid(repo.as_ref()).await;

    // Expiration
    expiration_elapsed_is_not_found(repo.as_ref()).await;
    expiration_reports_remaining(repo.as_ref()).await;
    expiration_absent_not_found(repo.as_ref()).await;

    // Counters
    increment_sequential(repo.as_ref()).await;
    increment_document_invalid(repo.as_ref()).await;
    increment_concurrent(Arc::clone(&repo)).await;

    // Pub/sub
    pubsub_fan_out(repo.as_ref()).await;
    pubsub_cancelled_receives_nothing(repo.as_ref()).await;
    pubsub_publish_without_subscribers(repo.as_ref()).await;

    // Lifecycle
    ping_succeeds(repo.as_ref()).await;
    plugin_lookup_missing_is_none(repo.as_ref()).await;
    close_ends_subscriptions(repo.as_ref()).await;
}
