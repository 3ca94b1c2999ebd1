//! Redis implementation of [`DataRepository`].
//!
//! Documents are stored with RedisJSON, searched with RediSearch, and every
//! key passes through the [`KeyCodec`] before it is sent.
//!
//! # Command Mapping
//!
//! | Operation | Command |
//! |-----------|---------|
//! | `create` | `JSON.SET key $ json NX` |
//! | `read` | `JSON.GET key` |
//! | `update` | `JSON.SET key $ json XX` |
//! | `upsert` | `JSON.SET key $ json` |
//! | `delete` | `DEL key` |
//! | `list` | `KEYS pattern`, then `JSON.GET` per key |
//! | `search` | `FT.SEARCH <prefix> query LIMIT offset limit [SORTBY field dir]` |
//! | `acquire_lock` | `SET key:lock 1 NX PX ttl` |
//! | `release_lock` | `DEL key:lock` |
//! | `publish` / `subscribe` | `PUBLISH` / `SUBSCRIBE` on `<prefix>:channel:<name>` |
//! | `set_expiration` / `get_expiration` | `PEXPIRE` / `PTTL` |
//! | `atomic_increment` | `INCR key` |

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use datarepo::{
    DataRepository, EntityIdentifier, ListEntry, PluginRegistry, RepositoryError,
    RepositoryPlugin, RepositoryResult, SearchQuery, Subscription,
};
use futures::StreamExt;
use redis::{aio::PubSub, Cmd, FromRedisValue, Value as RedisValue};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RedisConfig,
    connection::{self, CommandConnection, PubSubSource},
    error::{RedisRepositoryError, Result},
    keys::{KeyCodec, KeyMode},
    plugin::RedisCommandPlugin,
};

/// Registry name of the Redis backend.
pub const REDIS_BACKEND_NAME: &str = "redis";

/// Cancels the shutdown token when the last repository clone is dropped.
struct ShutdownGuard {
    token: CancellationToken,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Redis-backed repository.
///
/// Cloning is cheap; all clones share the same connections, plugins, and
/// subscriptions. Each subscription holds its own pub/sub connection, which
/// is released when the subscription ends.
#[derive(Clone)]
pub struct RedisRepository {
    connection: CommandConnection,
    pubsub: Arc<PubSubSource>,
    codec: KeyCodec,
    plugins: PluginRegistry,
    subscriber_buffer: usize,
    shutdown: CancellationToken,
    _shutdown_guard: Arc<ShutdownGuard>,
}

impl RedisRepository {
    /// Connects to the deployment described by `config`.
    ///
    /// The [`RedisCommandPlugin`] is registered on the new repository.
    ///
    /// # Errors
    ///
    /// - [`InvalidInput`](RepositoryError::InvalidInput) if the configuration
    ///   or its connection descriptor is malformed
    /// - [`OperationFailed`](RepositoryError::OperationFailed) if the servers
    ///   cannot be reached
    #[tracing::instrument(name = "connect", skip_all, fields(backend = REDIS_BACKEND_NAME))]
    pub async fn connect(config: RedisConfig) -> RepositoryResult<Self> {
        config.validate()?;
        let info = config.server_info()?;
        let (connection, pubsub) = connection::connect(&info).await?;
        tracing::info!(topology = %info.topology, name = %info.name, "connected to redis");

        let plugins = PluginRegistry::new();
        plugins.register(Arc::new(RedisCommandPlugin::new(connection.clone())));

        let shutdown = CancellationToken::new();
        Ok(Self {
            connection,
            pubsub: Arc::new(pubsub),
            codec: KeyCodec::new(config.key_prefix, config.key_separator),
            plugins,
            subscriber_buffer: config.subscriber_buffer,
            shutdown: shutdown.clone(),
            _shutdown_guard: Arc::new(ShutdownGuard { token: shutdown }),
        })
    }

    /// Returns the key codec used by this repository.
    #[must_use]
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    fn key(&self, id: &EntityIdentifier) -> RepositoryResult<String> {
        Ok(self.codec.encode(id, KeyMode::Exact)?)
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        Ok(self.connection.query(cmd).await?)
    }

    async fn json_set(&self, key: &str, value: &Value, condition: Option<&str>) -> Result<bool> {
        let mut cmd = redis::cmd("JSON.SET");
        cmd.arg(key).arg("$").arg(serde_json::to_string(value).map_err(|err| {
            RedisRepositoryError::UnexpectedReply { command: "JSON.SET", detail: err.to_string() }
        })?);
        if let Some(condition) = condition {
            cmd.arg(condition);
        }
        let reply: RedisValue = self.query(&cmd).await?;
        Ok(!matches!(reply, RedisValue::Nil))
    }

    async fn json_get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("JSON.GET").arg(key)).await
    }
}

impl fmt::Debug for RedisRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisRepository")
            .field("connection", &self.connection)
            .field("pubsub", &self.pubsub)
            .field("codec", &self.codec)
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Converts a TTL to whole milliseconds, rounding sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> RepositoryResult<i64> {
    let millis = if ttl.is_zero() { 0 } else { ttl.as_millis().max(1) };
    i64::try_from(millis)
        .map_err(|_| RepositoryError::invalid_input(format!("ttl too large: {ttl:?}")))
}

fn parse_document(key: &str, text: &str) -> RepositoryResult<Value> {
    serde_json::from_str(text).map_err(|err| {
        RepositoryError::operation_failed_with_source(
            format!("stored value at {key} is not valid JSON"),
            err,
        )
    })
}

/// Extracts identifiers from an `FT.SEARCH` reply: `[total, key, fields, key, fields, ...]`.
///
/// Keys that do not decode are skipped.
pub(crate) fn parse_search_reply(
    codec: &KeyCodec,
    reply: RedisValue,
) -> Result<Vec<EntityIdentifier>> {
    let unexpected = |detail: &str| RedisRepositoryError::UnexpectedReply {
        command: "FT.SEARCH",
        detail: detail.to_owned(),
    };
    let RedisValue::Array(items) = reply else {
        return Err(unexpected("expected an array"));
    };
    let mut items = items.into_iter();
    if !matches!(items.next(), Some(RedisValue::Int(_))) {
        return Err(unexpected("missing result count"));
    }

    Ok(items
        .step_by(2)
        .filter_map(|item| {
            let key = match item {
                RedisValue::BulkString(bytes) => String::from_utf8(bytes).ok()?,
                RedisValue::SimpleString(text) => text,
                _ => return None,
            };
            match codec.decode(&key) {
                Ok(identifier) => Some(identifier),
                Err(err) => {
                    tracing::debug!(key, error = %err, "skipping undecodable search hit");
                    None
                },
            }
        })
        .collect())
}

/// Forwards messages from a pub/sub connection into a subscription buffer.
///
/// Returning drops the connection, which unsubscribes.
async fn forward_messages(
    pubsub: PubSub,
    sender: mpsc::Sender<Bytes>,
    token: CancellationToken,
    shutdown: CancellationToken,
    channel: String,
) {
    let mut messages = std::pin::pin!(pubsub.into_on_message());
    loop {
        tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(channel, "subscription cancelled");
                break;
            }
            () = shutdown.cancelled() => {
                tracing::debug!(channel, "repository closed, ending subscription");
                break;
            }
            message = messages.next() => {
                let Some(message) = message else {
                    tracing::warn!(channel, "redis subscription stream ended");
                    break;
                };
                match sender.try_send(Bytes::copy_from_slice(message.get_payload_bytes())) {
                    Ok(()) => {},
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(channel, "subscriber buffer full, dropping message");
                    },
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}

#[async_trait]
impl DataRepository for RedisRepository {
    fn backend_name(&self) -> &'static str {
        REDIS_BACKEND_NAME
    }

    #[tracing::instrument(name = "create", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn create(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()> {
        let key = self.key(id)?;
        if !self.json_set(&key, &value, Some("NX")).await? {
            return Err(RepositoryError::already_exists(key));
        }
        Ok(())
    }

    #[tracing::instrument(name = "read", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn read(&self, id: &EntityIdentifier) -> RepositoryResult<Value> {
        let key = self.key(id)?;
        match self.json_get(&key).await? {
            Some(text) => parse_document(&key, &text),
            None => Err(RepositoryError::not_found(key)),
        }
    }

    #[tracing::instrument(name = "update", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn update(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()> {
        let key = self.key(id)?;
        if !self.json_set(&key, &value, Some("XX")).await? {
            return Err(RepositoryError::not_found(key));
        }
        Ok(())
    }

    #[tracing::instrument(name = "upsert", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn upsert(&self, id: &EntityIdentifier, value: Value) -> RepositoryResult<()> {
        let key = self.key(id)?;
        self.json_set(&key, &value, None).await?;
        Ok(())
    }

    #[tracing::instrument(name = "delete", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn delete(&self, id: &EntityIdentifier) -> RepositoryResult<()> {
        let key = self.key(id)?;
        let removed: i64 = self.query(redis::cmd("DEL").arg(&key)).await?;
        if removed == 0 {
            return Err(RepositoryError::not_found(key));
        }
        Ok(())
    }

    #[tracing::instrument(name = "list", skip_all, fields(backend = REDIS_BACKEND_NAME, pattern = %pattern))]
    async fn list(&self, pattern: &EntityIdentifier) -> RepositoryResult<Vec<ListEntry>> {
        let pattern_key = self.codec.encode(pattern, KeyMode::Pattern)?;
        let keys: Vec<String> = self.query(redis::cmd("KEYS").arg(&pattern_key)).await?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let identifier = match self.codec.decode(&key) {
                Ok(identifier) => identifier,
                Err(err) => {
                    tracing::debug!(key, error = %err, "skipping undecodable key");
                    continue;
                },
            };
            // Lock records and other suffixed keys decode to a shorter identifier.
            if self.codec.encode(&identifier, KeyMode::Exact).as_deref() != Ok(key.as_str()) {
                continue;
            }
            let text = match self.json_get(&key).await {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(key, error = %err, "skipping unreadable key");
                    continue;
                },
            };
            match parse_document(&key, &text) {
                Ok(value) => entries.push(ListEntry { identifier, value }),
                Err(err) => tracing::debug!(key, error = %err, "skipping undecodable value"),
            }
        }
        entries.sort_by_cached_key(|entry| entry.identifier.canonical());
        Ok(entries)
    }

    #[tracing::instrument(name = "search", skip_all, fields(backend = REDIS_BACKEND_NAME, query = %query.query))]
    async fn search(&self, query: &SearchQuery) -> RepositoryResult<Vec<EntityIdentifier>> {
        query.validate()?;

        let mut cmd = redis::cmd("FT.SEARCH");
        cmd.arg(self.codec.prefix())
            .arg(&query.query)
            .arg("LIMIT")
            .arg(query.offset)
            .arg(query.limit);
        if !query.sort_by.is_empty() {
            cmd.arg("SORTBY").arg(&query.sort_by).arg(query.sort_direction.as_str());
        }
        let reply: RedisValue = self.query(&cmd).await?;
        Ok(parse_search_reply(&self.codec, reply)?)
    }

    #[tracing::instrument(name = "acquire_lock", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn acquire_lock(&self, id: &EntityIdentifier, ttl: Duration) -> RepositoryResult<bool> {
        if ttl.is_zero() {
            return Err(RepositoryError::invalid_input("lock ttl must be greater than zero"));
        }
        let lock_key = self.codec.lock_key(&self.key(id)?);
        let millis = ttl_millis(ttl)?;

        let reply: RedisValue = self
            .query(redis::cmd("SET").arg(&lock_key).arg(1).arg("NX").arg("PX").arg(millis))
            .await?;
        Ok(!matches!(reply, RedisValue::Nil))
    }

    #[tracing::instrument(name = "release_lock", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn release_lock(&self, id: &EntityIdentifier) -> RepositoryResult<()> {
        let lock_key = self.codec.lock_key(&self.key(id)?);
        let removed: i64 = self.query(redis::cmd("DEL").arg(&lock_key)).await?;
        if removed == 0 {
            return Err(RepositoryError::not_found(lock_key));
        }
        Ok(())
    }

    #[tracing::instrument(name = "publish", skip_all, fields(backend = REDIS_BACKEND_NAME, channel = %channel))]
    async fn publish(&self, channel: &str, message: Bytes) -> RepositoryResult<()> {
        let wire_channel = self.codec.channel_name(channel);
        let receivers: i64 =
            self.query(redis::cmd("PUBLISH").arg(&wire_channel).arg(message.as_ref())).await?;
        tracing::trace!(receivers, "published message");
        Ok(())
    }

    #[tracing::instrument(name = "subscribe", skip_all, fields(backend = REDIS_BACKEND_NAME, channel = %channel))]
    async fn subscribe(
        &self,
        channel: &str,
        token: CancellationToken,
    ) -> RepositoryResult<Subscription> {
        if self.shutdown.is_cancelled() {
            return Err(RepositoryError::operation_failed("repository is closed"));
        }
        let wire_channel = self.codec.channel_name(channel);

        let mut pubsub = self.pubsub.open().await.map_err(RedisRepositoryError::from)?;
        // Confirmed before returning so an immediate publish is not missed.
        pubsub.subscribe(&wire_channel).await.map_err(RedisRepositoryError::from)?;
        tracing::debug!(channel = %wire_channel, "subscribed");

        let (sender, receiver) = mpsc::channel(self.subscriber_buffer);
        let subscription_token = token.child_token();
        tokio::spawn(forward_messages(
            pubsub,
            sender,
            subscription_token.clone(),
            self.shutdown.clone(),
            wire_channel,
        ));

        Ok(Subscription::new(channel, receiver, subscription_token))
    }

    #[tracing::instrument(name = "ping", skip_all, fields(backend = REDIS_BACKEND_NAME))]
    async fn ping(&self) -> RepositoryResult<()> {
        let _pong: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    #[tracing::instrument(name = "set_expiration", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn set_expiration(&self, id: &EntityIdentifier, ttl: Duration) -> RepositoryResult<()> {
        let key = self.key(id)?;
        let millis = ttl_millis(ttl)?;
        let updated: i64 = self.query(redis::cmd("PEXPIRE").arg(&key).arg(millis)).await?;
        if updated == 0 {
            return Err(RepositoryError::not_found(key));
        }
        Ok(())
    }

    #[tracing::instrument(name = "get_expiration", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn get_expiration(&self, id: &EntityIdentifier) -> RepositoryResult<Duration> {
        let key = self.key(id)?;
        let remaining: i64 = self.query(redis::cmd("PTTL").arg(&key)).await?;
        // -2: no such key, -1: no expiry.
        match u64::try_from(remaining) {
            Ok(millis) => Ok(Duration::from_millis(millis)),
            Err(_) => Err(RepositoryError::not_found(key)),
        }
    }

    #[tracing::instrument(name = "atomic_increment", skip_all, fields(backend = REDIS_BACKEND_NAME, id = %id))]
    async fn atomic_increment(&self, id: &EntityIdentifier) -> RepositoryResult<i64> {
        let key = self.key(id)?;
        let value: i64 = self
            .connection
            .query(redis::cmd("INCR").arg(&key))
            .await
            .map_err(|err| RedisRepositoryError::from_increment(&key, err))?;
        Ok(value)
    }

    #[tracing::instrument(name = "close", skip_all, fields(backend = REDIS_BACKEND_NAME))]
    async fn close(&self) -> RepositoryResult<()> {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            tracing::info!("redis repository closed");
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> RedisValue {
        RedisValue::BulkString(text.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_search_reply() {
        let reply = RedisValue::Array(vec![
            RedisValue::Int(2),
            bulk("app:user:1"),
            RedisValue::Array(vec![bulk("$"), bulk(r#"{"name":"Ada"}"#)]),
            bulk("app:user:2"),
            RedisValue::Array(vec![bulk("$"), bulk(r#"{"name":"Grace"}"#)]),
        ]);
        let ids = parse_search_reply(&KeyCodec::default(), reply).unwrap();
        assert_eq!(
            ids,
            vec![EntityIdentifier::structured("user", "1"), EntityIdentifier::structured("user", "2")]
        );
    }

    #[test]
    fn test_parse_search_reply_skips_foreign_keys() {
        let reply = RedisValue::Array(vec![
            RedisValue::Int(2),
            bulk("other:user:1"),
            RedisValue::Array(vec![]),
            bulk("app:user:2"),
            RedisValue::Array(vec![]),
        ]);
        let ids = parse_search_reply(&KeyCodec::default(), reply).unwrap();
        assert_eq!(ids, vec![EntityIdentifier::structured("user", "2")]);
    }

    #[test]
    fn test_parse_search_reply_empty() {
        let ids =
            parse_search_reply(&KeyCodec::default(), RedisValue::Array(vec![RedisValue::Int(0)]))
                .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_parse_search_reply_rejects_malformed() {
        let err = parse_search_reply(&KeyCodec::default(), RedisValue::Nil).unwrap_err();
        assert!(matches!(err, RedisRepositoryError::UnexpectedReply { command: "FT.SEARCH", .. }));

        let err = parse_search_reply(&KeyCodec::default(), RedisValue::Array(vec![bulk("x")]))
            .unwrap_err();
        assert!(matches!(err, RedisRepositoryError::UnexpectedReply { .. }));
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::ZERO).unwrap(), 0);
        assert_eq!(ttl_millis(Duration::from_micros(10)).unwrap(), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)).unwrap(), 2000);
        assert!(ttl_millis(Duration::MAX).unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_parse_document() {
        assert_eq!(parse_document("app:x:1", r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_document("app:x:1", "{oops").unwrap_err().is_operation_failed());
    }
}
