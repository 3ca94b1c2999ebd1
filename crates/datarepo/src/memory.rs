//! In-memory repository implementation.
//!
//! This module provides [`MemoryRepository`], an in-process implementation of
//! [`DataRepository`] for tests, development, and single-process deployments.
//!
//! # Features
//!
//! - **Thread-safe**: one [`parking_lot::RwLock`] guards every table
//! - **Ordered storage**: entities live in a [`BTreeMap`] keyed by canonical identifier
//! - **TTL support**: lazy eviction on access plus a background sweep
//! - **Pub/sub**: bounded per-subscriber buffers with drop-on-full delivery
//!
//! # Example
//!
//! ```
//! use datarepo::{DataRepository, EntityIdentifier, MemoryRepository};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let repo = MemoryRepository::new();
//!     let id = EntityIdentifier::structured("user", "123");
//!
//!     repo.create(&id, json!({"name": "Ada"})).await.unwrap();
//!     let value = repo.read(&id).await.unwrap();
//!
//!     assert_eq!(value["name"], "Ada");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; everything is lost when the process exits
//! - [`search`](DataRepository::search) is a substring scan over serialized
//!   documents and always orders by canonical identifier, ignoring `sort_by`
//! - Expired entries may linger in memory until the next access or sweep

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{
    config::MemoryConfig,
    error::{RepositoryError, RepositoryResult},
    identifier::{EntityIdentifier, CANONICAL_SEPARATOR},
    plugin::{PluginRegistry, RepositoryPlugin},
    repository::{DataRepository, ListEntry, SearchQuery, SortDirection, Subscription},
};

/// Registry name of the in-memory backend.
pub const MEMORY_BACKEND_NAME: &str = "memory";

/// A stored entity value.
#[derive(Debug, Clone)]
enum StoredValue {
    Document(Value),
    Counter(i64),
}

impl StoredValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Document(value) => value.clone(),
            Self::Counter(count) => Value::from(*count),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    identifier: EntityIdentifier,
    value: StoredValue,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Bytes>,
}

/// All repository state. Every table is guarded by the same lock.
#[derive(Default)]
struct Store {
    values: BTreeMap<String, StoredEntry>,
    locks: HashMap<String, Instant>,
    channels: HashMap<String, Vec<Subscriber>>,
    expiries: HashMap<String, Instant>,
    next_subscriber_id: u64,
    closed: bool,
}

impl Store {
    fn is_expired(&self, key: &str, now: Instant) -> bool {
        self.expiries.get(key).is_some_and(|expiry| *expiry <= now)
    }

    /// Removes `key` and its expiry if the expiry has elapsed.
    ///
    /// This is the only place expired entities are removed; the background
    /// sweep and the lazy read path both go through it.
    fn evict_if_expired(&mut self, key: &str, now: Instant) -> bool {
        if !self.is_expired(key, now) {
            return false;
        }
        self.values.remove(key);
        self.expiries.remove(key);
        true
    }

    /// Evicts every expired entity and lock. Returns the number of entities evicted.
    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let evicted = expired.iter().filter(|key| self.evict_if_expired(key, now)).count();
        self.locks.retain(|_, expiry| *expiry > now);
        evicted
    }

    /// Returns the entity under `key` unless it is absent or expired.
    fn live_entry(&self, key: &str, now: Instant) -> Option<&StoredEntry> {
        if self.is_expired(key, now) {
            return None;
        }
        self.values.get(key)
    }

    fn remove_subscriber(&mut self, channel: &str, subscriber_id: u64) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != subscriber_id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }
}

/// Cancels the shutdown token when the last repository clone is dropped.
struct ShutdownGuard {
    token: CancellationToken,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// In-memory repository backed by a [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryRepository` is cheaply cloneable via [`Arc`]. All clones share the
/// same store, plugins, and background tasks.
///
/// # Shutdown
///
/// The background sweep stops when [`close`](DataRepository::close) is called
/// or when every clone has been dropped.
#[derive(Clone)]
pub struct MemoryRepository {
    store: Arc<RwLock<Store>>,
    plugins: PluginRegistry,
    config: MemoryConfig,
    shutdown: CancellationToken,
    _shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryRepository {
    /// Creates a repository with the default configuration.
    ///
    /// This spawns the background expiry sweep, so it must be called from
    /// within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Creates a repository with the given configuration.
    ///
    /// A zero sweep interval or subscriber buffer is replaced by the
    /// default. Use [`try_with_config`](Self::try_with_config) to reject it instead.
    #[must_use]
    pub fn with_config(config: MemoryConfig) -> Self {
        let defaults = MemoryConfig::default();
        let config = MemoryConfig {
            sweep_interval: if config.sweep_interval.is_zero() {
                defaults.sweep_interval
            } else {
                config.sweep_interval
            },
            subscriber_buffer: if config.subscriber_buffer == 0 {
                defaults.subscriber_buffer
            } else {
                config.subscriber_buffer
            },
        };
        Self::spawn(config)
    }

    /// Creates a repository, validating the configuration first.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidInput`] if the configuration is invalid.
    pub fn try_with_config(config: MemoryConfig) -> RepositoryResult<Self> {
        config.validate()?;
        Ok(Self::spawn(config))
    }

    fn spawn(config: MemoryConfig) -> Self {
        let shutdown = CancellationToken::new();
        let repo = Self {
            store: Arc::new(RwLock::new(Store::default())),
            plugins: PluginRegistry::new(),
            config,
            shutdown: shutdown.clone(),
            _shutdown_guard: Arc::new(ShutdownGuard { token: shutdown.clone() }),
        };

        tokio::spawn(run_sweep(Arc::clone(&repo.store), repo.config.sweep_interval, shutdown));

        repo
    }

    /// Returns the configuration this repository was built with.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Evicts every expired entity and lock immediately.
    ///
    /// Returns the number of entities evicted. The background sweep calls the
    /// same routine on its interval.
    pub fn sweep_expired(&self) -> usize {
        self.store.write().sweep(Instant::now())
    }

    /// Returns the number of live subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.store.read().channels.get(channel).map_or(0, Vec::len)
    }

    /// Evicts `keys` that a shared-lock pass found expired.
    fn evict_expired(&self, keys: &[String], now: Instant) {
        if keys.is_empty() {
            return;
        }
        let mut store = self.store.write();
        for key in keys {
            store.evict_if_expired(key, now);
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRepository")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Background task that periodically sweeps expired entries.
async fn run_sweep(store: Arc<RwLock<Store>>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("memory repository sweep shutting down");
                break;
            }
            _ = ticker.tick() => {
                let evicted = store.write().sweep(Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired entries");
                }
            }
        }
    }
}

/// Compiles a glob pattern into an anchored regex.
///
/// `*` matches any run of characters and `?` matches exactly one; every other
/// character is matched literally.
/// Map key for `id`. Rejects identifiers whose canonical form another
/// identifier could share.
fn storage_key(id: &EntityIdentifier) -> RepositoryResult<String> {
    id.validate(CANONICAL_SEPARATOR)?;
    Ok(id.canonical())
}

fn glob_to_regex(pattern: &str) -> RepositoryResult<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|err| {
        RepositoryError::invalid_identifier_with_source(format!("invalid pattern: {pattern}"), err)
    })
}

fn expiry_after(now: Instant, ttl: Duration) -> RepositoryResult<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| RepositoryError::invalid_input(format!("ttl too large: {ttl:?}")))
}

#[async_trait]
impl DataRepository for MemoryRepository {
    fn backend_name(&self) -> &'static str {
        MEMORY_BACKEND_NAME
    }

    #[tracing::instrument(name = "create", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn create(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let mut store = self.store.write();
        store.evict_if_expired(&key, now);
        if store.values.contains_key(&key) {
            return Err(RepositoryError::already_exists(key));
        }
        store
            .values
            .insert(key, StoredEntry { identifier: id.clone(), value: StoredValue::Document(value) });
        Ok(())
    }

    #[tracing::instrument(name = "read", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn read(&self, id: &EntityIdentifier) -> RepositoryResult<Value> {
        let key = storage_key(id)?;
        let now = Instant::now();
        {
            let store = self.store.read();
            if !store.is_expired(&key, now) {
                return store
                    .values
                    .get(&key)
                    .map(|entry| entry.value.to_json())
                    .ok_or_else(|| RepositoryError::not_found(key));
            }
        }
        self.store.write().evict_if_expired(&key, now);
        Err(RepositoryError::not_found(key))
    }

    #[tracing::instrument(name = "update", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn update(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let mut store = self.store.write();
        store.evict_if_expired(&key, now);
        match store.values.get_mut(&key) {
            Some(entry) => {
                entry.value = StoredValue::Document(value);
                Ok(())
            },
            None => Err(RepositoryError::not_found(key)),
        }
    }

    #[tracing::instrument(name = "upsert", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn upsert(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let mut store = self.store.write();
        store.evict_if_expired(&key, now);
        store
            .values
            .insert(key, StoredEntry { identifier: id.clone(), value: StoredValue::Document(value) });
        Ok(())
    }

    #[tracing::instrument(name = "delete", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn delete(&self, id: &EntityIdentifier) -> RepositoryResult<()> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let mut store = self.store.write();
        if store.evict_if_expired(&key, now) || store.values.remove(&key).is_none() {
            return Err(RepositoryError::not_found(key));
        }
        store.expiries.remove(&key);
        Ok(())
    }

    #[tracing::instrument(name = "list", skip_all, fields(backend = MEMORY_BACKEND_NAME, pattern = %pattern))]
    async fn list(&self, pattern: &EntityIdentifier) -> RepositoryResult<Vec<ListEntry>> {
        let matcher = glob_to_regex(&storage_key(pattern)?)?;
        let now = Instant::now();
        let mut expired = Vec::new();
        let entries: Vec<ListEntry> = {
            let store = self.store.read();
            store
                .values
                .iter()
                .filter(|(key, _)| matcher.is_match(key))
                .filter_map(|(key, entry)| {
                    if store.is_expired(key, now) {
                        expired.push(key.clone());
                        return None;
                    }
                    Some(ListEntry {
                        identifier: entry.identifier.clone(),
                        value: entry.value.to_json(),
                    })
                })
                .collect()
        };
        self.evict_expired(&expired, now);
        Ok(entries)
    }

    #[tracing::instrument(name = "search", skip_all, fields(backend = MEMORY_BACKEND_NAME, query = %query.query))]
    async fn search(&self, query: &SearchQuery) -> RepositoryResult<Vec<EntityIdentifier>> {
        query.validate()?;

        let now = Instant::now();
        let mut expired = Vec::new();
        // BTreeMap iteration yields canonical-key order.
        let mut matches: Vec<EntityIdentifier> = {
            let store = self.store.read();
            store
                .values
                .iter()
                .filter_map(|(key, entry)| {
                    if store.is_expired(key, now) {
                        expired.push(key.clone());
                        return None;
                    }
                    entry
                        .value
                        .to_json()
                        .to_string()
                        .contains(&query.query)
                        .then(|| entry.identifier.clone())
                })
                .collect()
        };
        self.evict_expired(&expired, now);

        if query.sort_direction == SortDirection::Desc {
            matches.reverse();
        }

        // validate() guarantees both are non-negative.
        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    #[tracing::instrument(name = "acquire_lock", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn acquire_lock(&self, id: &EntityIdentifier, ttl: Duration) -> RepositoryResult<bool> {
        if ttl.is_zero() {
            return Err(RepositoryError::invalid_input("lock ttl must be greater than zero"));
        }
        let key = storage_key(id)?;
        let now = Instant::now();
        let expiry = expiry_after(now, ttl)?;

        let mut store = self.store.write();
        if store.locks.get(&key).is_some_and(|held_until| *held_until > now) {
            return Ok(false);
        }
        store.locks.insert(key, expiry);
        Ok(true)
    }

    #[tracing::instrument(name = "release_lock", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn release_lock(&self, id: &EntityIdentifier) -> RepositoryResult<()> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let mut store = self.store.write();
        match store.locks.remove(&key) {
            Some(held_until) if held_until > now => Ok(()),
            _ => Err(RepositoryError::not_found(format!("{key}:lock"))),
        }
    }

    #[tracing::instrument(name = "publish", skip_all, fields(backend = MEMORY_BACKEND_NAME, channel = %channel))]
    async fn publish(&self, channel: &str, message: Bytes) -> RepositoryResult<()> {
        let store = self.store.read();
        let Some(subscribers) = store.channels.get(channel) else {
            return Ok(());
        };
        for subscriber in subscribers {
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        channel,
                        subscriber = subscriber.id,
                        "subscriber buffer full, dropping message"
                    );
                },
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(channel, subscriber = subscriber.id, "subscriber already gone");
                },
            }
        }
        Ok(())
    }

    #[tracing::instrument(name = "subscribe", skip_all, fields(backend = MEMORY_BACKEND_NAME, channel = %channel))]
    async fn subscribe(
        &self,
        channel: &str,
        token: CancellationToken,
    ) -> RepositoryResult<Subscription> {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_buffer);
        let subscriber_id = {
            let mut store = self.store.write();
            if store.closed {
                return Err(RepositoryError::operation_failed("repository is closed"));
            }
            let subscriber_id = store.next_subscriber_id;
            store.next_subscriber_id += 1;
            store
                .channels
                .entry(channel.to_owned())
                .or_default()
                .push(Subscriber { id: subscriber_id, sender });
            subscriber_id
        };
        tracing::debug!(channel, subscriber = subscriber_id, "subscriber registered");

        // Cancelled by the caller or by dropping the subscription.
        let subscription_token = token.child_token();
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();
        let cleanup_token = subscription_token.clone();
        let channel_name = channel.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                _ = cleanup_token.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
            if store.write().remove_subscriber(&channel_name, subscriber_id) {
                tracing::debug!(
                    channel = %channel_name,
                    subscriber = subscriber_id,
                    "subscriber removed"
                );
            }
        });

        Ok(Subscription::new(channel, receiver, subscription_token))
    }

    #[tracing::instrument(name = "ping", skip_all, fields(backend = MEMORY_BACKEND_NAME))]
    async fn ping(&self) -> RepositoryResult<()> {
        fail_point!("memory-ping", |_| {
            Err(RepositoryError::operation_failed("injected failure in memory ping"))
        });
        let _store = self.store.read();
        Ok(())
    }

    #[tracing::instrument(name = "set_expiration", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn set_expiration(&self, id: &EntityIdentifier, ttl: Duration) -> RepositoryResult<()> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let expiry = expiry_after(now, ttl)?;
        let mut store = self.store.write();
        store.evict_if_expired(&key, now);
        if !store.values.contains_key(&key) {
            return Err(RepositoryError::not_found(key));
        }
        store.expiries.insert(key, expiry);
        Ok(())
    }

    #[tracing::instrument(name = "get_expiration", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn get_expiration(&self, id: &EntityIdentifier) -> RepositoryResult<Duration> {
        let key = storage_key(id)?;
        let now = Instant::now();
        {
            let store = self.store.read();
            if store.live_entry(&key, now).is_some() {
                return store
                    .expiries
                    .get(&key)
                    .map(|expiry| expiry.saturating_duration_since(now))
                    .ok_or_else(|| RepositoryError::not_found(key));
            }
        }
        self.store.write().evict_if_expired(&key, now);
        Err(RepositoryError::not_found(key))
    }

    #[tracing::instrument(name = "atomic_increment", skip_all, fields(backend = MEMORY_BACKEND_NAME, id = %id))]
    async fn atomic_increment(&self, id: &EntityIdentifier) -> RepositoryResult<i64> {
        let key = storage_key(id)?;
        let now = Instant::now();
        let mut store = self.store.write();
        store.evict_if_expired(&key, now);
        let entry = store
            .values
            .entry(key.clone())
            .or_insert_with(|| StoredEntry { identifier: id.clone(), value: StoredValue::Counter(0) });
        match &mut entry.value {
            StoredValue::Counter(count) => {
                *count = count.checked_add(1).ok_or_else(|| {
                    RepositoryError::invalid_input(format!("counter overflow: {key}"))
                })?;
                Ok(*count)
            },
            StoredValue::Document(_) => Err(RepositoryError::invalid_input(format!(
                "value at {key} is not an integer counter"
            ))),
        }
    }

    #[tracing::instrument(name = "close", skip_all, fields(backend = MEMORY_BACKEND_NAME))]
    async fn close(&self) -> RepositoryResult<()> {
        self.shutdown.cancel();
        let mut store = self.store.write();
        if !store.closed {
            store.closed = true;
            let dropped: usize = store.channels.values().map(Vec::len).sum();
            store.channels.clear();
            tracing::debug!(subscribers = dropped, "memory repository closed");
        }
        Ok(())
    }

    fn register_plugin(&self, plugin: Arc<dyn RepositoryPlugin>) {
        self.plugins.register(plugin);
    }

    fn get_plugin(&self, name: &str) -> Option<Arc<dyn RepositoryPlugin>> {
        self.plugins.get(name)
    }
}
