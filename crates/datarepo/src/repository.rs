//! Repository contract.
//!
//! This module defines the [`DataRepository`] trait, the single contract that
//! every storage engine satisfies identically, along with the value types that
//! cross it.
//!
//! # Design
//!
//! - **Values are JSON**: documents travel as [`serde_json::Value`] so the
//!   trait stays object-safe and the registry can hand out
//!   `Arc<dyn DataRepository>`. [`DataRepositoryExt`] layers typed
//!   serialization on top.
//! - **Cancellation by drop**: dropping an operation's future cancels it.
//!   Subscriptions additionally take a [`CancellationToken`].
//! - **Best-effort listing**: [`list`](DataRepository::list) and
//!   [`search`](DataRepository::search) skip entries that fail to decode or
//!   fetch instead of failing the whole call. Results are not a transactional
//!   snapshot.
//!
//! # Implementing a Backend
//!
//! 1. Implement [`DataRepository`]
//! 2. Map backend-specific errors to [`RepositoryError`]
//! 3. Run the [`conformance`](crate::conformance) suite against it
//!
//! See [`MemoryRepository`](crate::MemoryRepository) for a reference implementation.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};

use crate::{
    error::{RepositoryError, RepositoryResult},
    identifier::EntityIdentifier,
    plugin::RepositoryPlugin,
};

/// One entity returned by [`DataRepository::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    /// The identifier the entity is stored under.
    pub identifier: EntityIdentifier,
    /// The stored document.
    pub value: Value,
}

/// Sort order for [`SearchQuery`] results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

impl SortDirection {
    /// Returns the wire spelling (`ASC` or `DESC`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortDirection {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("asc") {
            Ok(Self::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Ok(Self::Desc)
        } else {
            Err(RepositoryError::invalid_input(format!("unknown sort direction: {s}")))
        }
    }
}

/// Parameters for [`DataRepository::search`].
///
/// `offset` and `limit` are signed so a negative value can be represented and
/// rejected locally with [`InvalidInput`](RepositoryError::InvalidInput).
///
/// # Example
///
/// ```
/// use datarepo::{SearchQuery, SortDirection};
///
/// let query = SearchQuery::builder()
///     .query("Ada")
///     .limit(20)
///     .sort_by("name")
///     .sort_direction(SortDirection::Desc)
///     .build();
///
/// assert_eq!(query.offset, 0);
/// assert_eq!(query.limit, 20);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Backend query text. A substring for the in-process backend, a
    /// RediSearch query for the networked backend.
    #[builder(into)]
    pub query: String,

    /// Number of matches to skip.
    #[builder(default)]
    #[serde(default)]
    pub offset: i64,

    /// Maximum number of matches to return.
    #[builder(default = DEFAULT_SEARCH_LIMIT)]
    #[serde(default = "default_search_limit")]
    pub limit: i64,

    /// Field to sort by. Empty means backend default order.
    #[builder(default, into)]
    #[serde(default)]
    pub sort_by: String,

    /// Sort order.
    #[builder(default)]
    #[serde(default)]
    pub sort_direction: SortDirection,
}

/// Default page size for [`SearchQuery`].
pub const DEFAULT_SEARCH_LIMIT: i64 = 10;

fn default_search_limit() -> i64 {
    DEFAULT_SEARCH_LIMIT
}

impl SearchQuery {
    /// Creates a query with default paging and ordering.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self::builder().query(query).build()
    }

    /// Rejects negative paging parameters.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidInput`] if `offset` or `limit` is negative.
    pub fn validate(&self) -> RepositoryResult<()> {
        if self.offset < 0 {
            return Err(RepositoryError::invalid_input(format!(
                "search offset must not be negative, got {}",
                self.offset
            )));
        }
        if self.limit < 0 {
            return Err(RepositoryError::invalid_input(format!(
                "search limit must not be negative, got {}",
                self.limit
            )));
        }
        Ok(())
    }
}

/// A live pub/sub subscription.
///
/// Yields message payloads in publish order. The stream ends when the
/// subscriber's [`CancellationToken`] fires, when the repository is closed,
/// or when the backend drops the sending side. Nothing is yielded once the
/// token is cancelled, even if the backend has not yet released its sink.
/// Dropping the subscription cancels it.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    _cancel_on_drop: DropGuard,
}

impl Subscription {
    /// Wraps a receiver fed by a backend. `token` is cancelled when the
    /// subscription is dropped so the backend can release its sink.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        receiver: mpsc::Receiver<Bytes>,
        token: CancellationToken,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            token: token.clone(),
            cancelled: Box::pin(token.clone().cancelled_owned()),
            _cancel_on_drop: token.drop_guard(),
        }
    }

    /// The logical channel name this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receives the next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            this.receiver.close();
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("channel", &self.channel).finish_non_exhaustive()
    }
}

/// Backend-agnostic data access contract.
///
/// Every backend must satisfy the same observable behavior for every
/// operation; the [`conformance`](crate::conformance) suite encodes it.
///
/// # Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`create`](DataRepository::create) | Store a new entity, failing if it exists |
/// | [`read`](DataRepository::read) | Fetch an entity |
/// | [`update`](DataRepository::update) | Overwrite an existing entity |
/// | [`upsert`](DataRepository::upsert) | Create or overwrite unconditionally |
/// | [`delete`](DataRepository::delete) | Remove an entity |
/// | [`list`](DataRepository::list) | Enumerate entities matching a pattern |
/// | [`search`](DataRepository::search) | Paged query returning identifiers |
/// | [`acquire_lock`](DataRepository::acquire_lock) | Non-blocking TTL lock |
/// | [`release_lock`](DataRepository::release_lock) | Release a held lock |
/// | [`publish`](DataRepository::publish) | Fire-and-forget message |
/// | [`subscribe`](DataRepository::subscribe) | Receive channel messages |
/// | [`ping`](DataRepository::ping) | Connectivity check |
/// | [`set_expiration`](DataRepository::set_expiration) | Attach a TTL |
/// | [`get_expiration`](DataRepository::get_expiration) | Remaining TTL |
/// | [`atomic_increment`](DataRepository::atomic_increment) | Counter increment |
/// | [`close`](DataRepository::close) | Release resources |
#[async_trait]
pub trait DataRepository: Send + Sync + fmt::Debug {
    /// The registry name of this backend (`"memory"`, `"redis"`).
    fn backend_name(&self) -> &'static str;

    /// Stores a new entity.
    ///
    /// # Errors
    ///
    /// - [`AlreadyExists`](RepositoryError::AlreadyExists) if a live entity is stored under `id`
    /// - [`InvalidIdentifier`](RepositoryError::InvalidIdentifier) if `id` cannot be encoded
    async fn create(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()>;

    /// Fetches an entity.
    ///
    /// # Errors
    ///
    /// [`NotFound`](RepositoryError::NotFound) if the entity is absent or expired.
    async fn read(&self, id: &EntityIdentifier) -> RepositoryResult<Value>;

    /// Replaces an existing entity. This is a full overwrite, not a merge.
    ///
    /// # Errors
    ///
    /// [`NotFound`](RepositoryError::NotFound) if the entity is absent.
    async fn update(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()>;

    /// Creates or fully overwrites an entity.
    async fn upsert(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()>;

    /// Removes an entity.
    ///
    /// # Errors
    ///
    /// [`NotFound`](RepositoryError::NotFound) if the entity is absent.
    async fn delete(&self, id: &EntityIdentifier) -> RepositoryResult<()>;

    /// Lists entities whose identifier matches `pattern`.
    ///
    /// `*` matches any run of characters and `?` matches one character.
    /// Entries that fail to decode or fetch are skipped. Results are sorted
    /// by canonical identifier.
    async fn list(&self, pattern: &EntityIdentifier) -> RepositoryResult<Vec<ListEntry>>;

    /// Runs a paged search and returns matching identifiers.
    ///
    /// # Errors
    ///
    /// [`InvalidInput`](RepositoryError::InvalidInput) if `offset` or `limit` is negative.
    async fn search(&self, query: &SearchQuery) -> RepositoryResult<Vec<EntityIdentifier>>;

    /// Attempts to take the lock for `id` without blocking.
    ///
    /// Returns `true` if the lock was acquired and `false` if a live lock is
    /// already held. The lock expires on its own after `ttl`.
    ///
    /// # Errors
    ///
    /// [`InvalidInput`](RepositoryError::InvalidInput) if `ttl` is zero.
    async fn acquire_lock(&self, id: &EntityIdentifier, ttl: Duration) -> RepositoryResult<bool>;

    /// Releases the lock for `id`.
    ///
    /// # Errors
    ///
    /// [`NotFound`](RepositoryError::NotFound) if no live lock exists.
    async fn release_lock(&self, id: &EntityIdentifier) -> RepositoryResult<()>;

    /// Publishes a message to every subscriber currently registered on `channel`.
    ///
    /// Delivery is at most once. A subscriber whose buffer is full misses the
    /// message; other subscribers are unaffected.
    async fn publish(&self, channel: &str, message: Bytes) -> RepositoryResult<()>;

    /// Subscribes to `channel` until `token` is cancelled.
    async fn subscribe(
        &self,
        channel: &str,
        token: CancellationToken,
    ) -> RepositoryResult<Subscription>;

    /// Checks that the backend is reachable.
    ///
    /// # Errors
    ///
    /// [`OperationFailed`](RepositoryError::OperationFailed) on connectivity failure.
    async fn ping(&self) -> RepositoryResult<()>;

    /// Sets the time-to-live of an existing entity.
    ///
    /// # Errors
    ///
    /// [`NotFound`](RepositoryError::NotFound) if the entity is absent.
    async fn set_expiration(&self, id: &EntityIdentifier, ttl: Duration) -> RepositoryResult<()>;

    /// Returns the remaining time-to-live of an entity.
    ///
    /// # Errors
    ///
    /// [`NotFound`](RepositoryError::NotFound) if no expiry is set or it has elapsed.
    async fn get_expiration(&self, id: &EntityIdentifier) -> RepositoryResult<Duration>;

    /// Increments the counter stored under `id` and returns the new value.
    ///
    /// An absent counter starts at zero, so the first call returns 1.
    ///
    /// # Errors
    ///
    /// [`InvalidInput`](RepositoryError::InvalidInput) if the stored value is not an integer counter.
    async fn atomic_increment(&self, id: &EntityIdentifier) -> RepositoryResult<i64>;

    /// Releases resources, ends every live subscription, and stops background
    /// tasks. Calling it more than once is harmless.
    async fn close(&self) -> RepositoryResult<()>;

    /// Registers a plugin. A plugin with the same name is replaced.
    fn register_plugin(&self, plugin: Arc<dyn RepositoryPlugin>);

    /// Looks up a plugin by name.
    fn get_plugin(&self, name: &str) -> Option<Arc<dyn RepositoryPlugin>>;
}

/// Typed convenience methods over [`DataRepository`].
///
/// Implemented for every repository, including `dyn DataRepository`.
///
/// # Example
///
/// ```
/// use datarepo::{DataRepositoryExt, EntityIdentifier, MemoryRepository};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct User {
///     name: String,
/// }
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let repo = MemoryRepository::new();
/// let id = EntityIdentifier::structured("user", "1");
///
/// repo.create_as(&id, &User { name: "Ada".into() }).await.unwrap();
/// let user: User = repo.read_as(&id).await.unwrap();
/// assert_eq!(user.name, "Ada");
/// # });
/// ```
#[async_trait]
pub trait DataRepositoryExt: DataRepository {
    /// Serializes `value` and [`create`](DataRepository::create)s it.
    async fn create_as<T>(&self, id: &EntityIdentifier, value: &T) -> RepositoryResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.create(id, serde_json::to_value(value)?).await
    }

    /// [`read`](DataRepository::read)s and deserializes an entity.
    async fn read_as<T>(&self, id: &EntityIdentifier) -> RepositoryResult<T>
    where
        T: DeserializeOwned,
    {
        let value = self.read(id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes `value` and [`update`](DataRepository::update)s it.
    async fn update_as<T>(&self, id: &EntityIdentifier, value: &T) -> RepositoryResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.update(id, serde_json::to_value(value)?).await
    }

    /// Serializes `value` and [`upsert`](DataRepository::upsert)s it.
    async fn upsert_as<T>(&self, id: &EntityIdentifier, value: &T) -> RepositoryResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.upsert(id, serde_json::to_value(value)?).await
    }
}

impl<R: DataRepository + ?Sized> DataRepositoryExt for R {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_search_query_defaults() {
        let query = SearchQuery::new("ada");
        assert_eq!(query.offset, 0);
        assert_eq!(query.limit, DEFAULT_SEARCH_LIMIT);
        assert!(query.sort_by.is_empty());
        assert_eq!(query.sort_direction, SortDirection::Asc);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_search_query_rejects_negative_paging() {
        let query = SearchQuery::builder().query("x").offset(-1).build();
        assert!(query.validate().unwrap_err().is_invalid_input());

        let query = SearchQuery::builder().query("x").limit(-5).build();
        assert!(query.validate().unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_search_query_deserializes_with_defaults() {
        let query: SearchQuery = serde_json::from_str(r#"{"query":"ada","sort_direction":"DESC"}"#)
            .unwrap();
        assert_eq!(query.limit, DEFAULT_SEARCH_LIMIT);
        assert_eq!(query.sort_direction, SortDirection::Desc);
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!("desc".parse::<SortDirection>().unwrap(), SortDirection::Desc);
        assert_eq!("ASC".parse::<SortDirection>().unwrap(), SortDirection::Asc);
        assert!("sideways".parse::<SortDirection>().is_err());
        assert_eq!(SortDirection::Desc.to_string(), "DESC");
    }

    #[tokio::test]
    async fn test_subscription_stream_and_drop_guard() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let mut subscription = Subscription::new("events", rx, token.clone());

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(tx);

        assert_eq!(subscription.channel(), "events");
        assert_eq!(subscription.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(subscription.next().await, Some(Bytes::from_static(b"two")));
        assert_eq!(subscription.next().await, None);

        assert!(!token.is_cancelled());
        drop(subscription);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscription_ends_on_cancel_with_buffered_messages() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let mut subscription = Subscription::new("events", rx, token.clone());

        token.cancel();
        // The sender is still alive, as it would be before the backend cleans up.
        tx.send(Bytes::from_static(b"late")).await.ok();

        assert_eq!(subscription.recv().await, None);
        assert_eq!(subscription.next().await, None);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_stream_wakes_on_cancel() {
        let (_tx, rx) = mpsc::channel::<Bytes>(4);
        let token = CancellationToken::new();
        let mut subscription = Subscription::new("events", rx, token.clone());

        let waiter = tokio::spawn(async move { subscription.next().await });
        tokio::task::yield_now().await;
        token.cancel();

        let ended = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(ended, None);
    }
}
