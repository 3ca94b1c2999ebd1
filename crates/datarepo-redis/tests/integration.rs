//! Integration tests against a live Redis server.
//!
//! The server must load the RedisJSON and RediSearch modules (for example
//! the `redis/redis-stack-server` image). Tests are skipped unless
//! `DATAREPO_REDIS_DESCRIPTOR` holds a connection descriptor such as
//! `single;local;;;;;;0;127.0.0.1:6379`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use datarepo::{
    assert_error_kind, assert_not_found, conformance, DataRepository, EntityIdentifier,
    RepositoryRegistry, SearchQuery,
};
use datarepo_redis::{RedisConfig, RedisRepository, REDIS_BACKEND_NAME, REDIS_COMMAND_PLUGIN};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const DESCRIPTOR_VAR: &str = "DATAREPO_REDIS_DESCRIPTOR";

fn config(prefix: &str) -> Option<RedisConfig> {
    let Ok(descriptor) = std::env::var(DESCRIPTOR_VAR) else {
        eprintln!("{DESCRIPTOR_VAR} not set, skipping");
        return None;
    };
    Some(
        RedisConfig::builder()
            .connection_string(descriptor)
            .key_prefix(prefix)
            .build()
            .expect("valid config"),
    )
}

/// Connects with a per-test namespace so tests can run in parallel.
async fn repository(prefix: &str) -> Option<RedisRepository> {
    let config = config(prefix)?;
    Some(RedisRepository::connect(config).await.expect("connect to redis"))
}

#[tokio::test(flavor = "multi_thread")]
async fn redis_repository_conformance() {
    let Some(repo) = repository("conformance").await else { return };
    conformance::run_all(Arc::new(repo)).await;
}

#[tokio::test]
async fn registry_constructs_redis_backend() {
    let Some(config) = config("registry") else { return };
    let registry = RepositoryRegistry::new();
    datarepo_redis::register(&registry);

    let repo = registry.create(REDIS_BACKEND_NAME, Arc::new(config)).await.unwrap();
    assert_eq!(repo.backend_name(), REDIS_BACKEND_NAME);
    repo.ping().await.unwrap();
}

#[tokio::test]
async fn list_skips_lock_records() {
    let Some(repo) = repository("locks").await else { return };
    let id = EntityIdentifier::structured("job", "1");
    let _ = repo.delete(&id).await;
    let _ = repo.release_lock(&id).await;

    repo.create(&id, json!({ "state": "queued" })).await.unwrap();
    assert!(repo.acquire_lock(&id, Duration::from_secs(5)).await.unwrap());

    let entries = repo.list(&EntityIdentifier::structured("job", "*")).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].identifier, id);

    repo.release_lock(&id).await.unwrap();
    repo.delete(&id).await.unwrap();
}

#[tokio::test]
async fn set_expiration_on_missing_key_not_found() {
    let Some(repo) = repository("ttl").await else { return };
    let id = EntityIdentifier::structured("session", "absent");
    let _ = repo.delete(&id).await;

    assert_not_found!(repo.set_expiration(&id, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn invalid_identifier_is_rejected_locally() {
    let Some(repo) = repository("validate").await else { return };

    let result = repo.read(&EntityIdentifier::structured("9user", "1")).await;
    assert_error_kind!(result, InvalidIdentifier);

    let result = repo.create(&EntityIdentifier::structured("user", "a:b"), json!({})).await;
    assert_error_kind!(result, InvalidIdentifier);
}

#[tokio::test]
async fn raw_command_plugin_round_trip() {
    let Some(repo) = repository("plugin").await else { return };
    let plugin = repo.get_plugin(REDIS_COMMAND_PLUGIN).expect("plugin registered on connect");

    let reply = plugin.execute("SET", &[json!("plugin:raw"), json!("v")]).await.unwrap();
    assert_eq!(reply, json!("OK"));
    let reply = plugin.execute("GET", &[json!("plugin:raw")]).await.unwrap();
    assert_eq!(reply, json!("v"));
    let reply = plugin.execute("DEL", &[json!("plugin:raw")]).await.unwrap();
    assert_eq!(reply, json!(1));
}

#[tokio::test]
async fn search_with_index() {
    let Some(repo) = repository("search").await else { return };
    let plugin = repo.get_plugin(REDIS_COMMAND_PLUGIN).unwrap();

    // The index name is the key prefix.
    let _ = plugin.execute("FT.DROPINDEX", &[json!("search")]).await;
    plugin
        .execute(
            "FT.CREATE",
            &[
                json!("search"),
                json!("ON"),
                json!("JSON"),
                json!("PREFIX"),
                json!(1),
                json!("search:"),
                json!("SCHEMA"),
                json!("$.name"),
                json!("AS"),
                json!("name"),
                json!("TEXT"),
                json!("SORTABLE"),
            ],
        )
        .await
        .unwrap();

    for (id, name) in [("1", "Ada"), ("2", "Grace"), ("3", "Alan")] {
        repo.upsert(&EntityIdentifier::structured("user", id), json!({ "name": name }))
            .await
            .unwrap();
    }

    let query = SearchQuery::builder()
        .query("Ada|Alan")
        .sort_by("name")
        .sort_direction(datarepo::SortDirection::Desc)
        .build();
    let mut ids = Vec::new();
    // Indexing is asynchronous.
    for _ in 0..20 {
        ids = repo.search(&query).await.unwrap();
        if ids.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        ids,
        vec![EntityIdentifier::structured("user", "3"), EntityIdentifier::structured("user", "1")]
    );

    plugin.execute("FT.DROPINDEX", &[json!("search"), json!("DD")]).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_ends_when_token_cancelled() {
    let Some(repo) = repository("pubsub").await else { return };
    let token = CancellationToken::new();
    let mut subscription = repo.subscribe("events", token.clone()).await.unwrap();

    repo.publish("events", Bytes::from_static(b"first")).await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("message delivered");
    assert_eq!(message, Some(Bytes::from_static(b"first")));

    token.cancel();
    let ended = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("subscription should end");
    assert_eq!(ended, None);
}
