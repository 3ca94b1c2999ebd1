//! Topology-specific Redis connections.
//!
//! A [`ServerInfo`] is resolved once into a command connection and a source
//! of dedicated pub/sub connections:
//!
//! | Topology | Commands | Pub/sub |
//! |----------|----------|---------|
//! | single | [`ConnectionManager`] (reconnects on failure) | the node |
//! | sentinel | multiplexed connection to the resolved master | the current master |
//! | cluster | [`ClusterConnection`] | the first seed node |

use std::fmt;

use redis::{
    aio::{ConnectionManager, MultiplexedConnection, PubSub},
    cluster::ClusterClientBuilder,
    cluster_async::ClusterConnection,
    sentinel::{Sentinel, SentinelClient, SentinelNodeConnectionInfo, SentinelServerType},
    Client, Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, RedisConnectionInfo, RedisResult,
};
use tokio::sync::Mutex;

use crate::{
    config::{ServerInfo, Topology},
    error::{RedisRepositoryError, Result},
};

/// Connection used for every non-pub/sub command.
#[derive(Clone)]
pub(crate) enum CommandConnection {
    Single(ConnectionManager),
    Sentinel(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl CommandConnection {
    /// Sends `cmd` on a clone of the multiplexed handle and converts the reply.
    pub(crate) async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> RedisResult<T> {
        match self {
            Self::Single(connection) => cmd.query_async(&mut connection.clone()).await,
            Self::Sentinel(connection) => cmd.query_async(&mut connection.clone()).await,
            Self::Cluster(connection) => cmd.query_async(&mut connection.clone()).await,
        }
    }
}

impl fmt::Debug for CommandConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topology = match self {
            Self::Single(_) => Topology::Single,
            Self::Sentinel(_) => Topology::Sentinel,
            Self::Cluster(_) => Topology::Cluster,
        };
        f.debug_tuple("CommandConnection").field(&topology).finish()
    }
}

/// Opens dedicated connections for subscriptions.
pub(crate) enum PubSubSource {
    /// A fixed node.
    Direct(Client),
    /// The master currently reported by the sentinels.
    Sentinel {
        sentinel: Mutex<Sentinel>,
        master_name: String,
        node: SentinelNodeConnectionInfo,
    },
}

impl PubSubSource {
    /// Opens a new pub/sub connection.
    pub(crate) async fn open(&self) -> RedisResult<PubSub> {
        match self {
            Self::Direct(client) => client.get_async_pubsub().await,
            Self::Sentinel { sentinel, master_name, node } => {
                let client =
                    sentinel.lock().await.async_master_for(master_name, Some(node)).await?;
                client.get_async_pubsub().await
            },
        }
    }
}

impl fmt::Debug for PubSubSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("PubSubSource::Direct"),
            Self::Sentinel { master_name, .. } => {
                f.debug_struct("PubSubSource::Sentinel").field("master_name", master_name).finish()
            },
        }
    }
}

fn connection_info(host: &str, port: u16, redis: RedisConnectionInfo) -> ConnectionInfo {
    ConnectionInfo { addr: ConnectionAddr::Tcp(host.to_owned(), port), redis }
}

/// Connects to the deployment described by `info`.
pub(crate) async fn connect(info: &ServerInfo) -> Result<(CommandConnection, PubSubSource)> {
    let data_node = RedisConnectionInfo {
        db: info.db,
        username: info.username.clone(),
        password: info.password.clone(),
        ..Default::default()
    };

    match info.topology {
        Topology::Single => {
            let (host, port) = info
                .addrs
                .first()
                .ok_or_else(|| RedisRepositoryError::Descriptor("no address".into()))?;
            let client = Client::open(connection_info(host, *port, data_node))?;
            let manager = ConnectionManager::new(client.clone()).await?;
            Ok((CommandConnection::Single(manager), PubSubSource::Direct(client)))
        },
        Topology::Sentinel => {
            if info.master_name.is_empty() {
                return Err(RedisRepositoryError::Descriptor(
                    "sentinel mode requires a master name".into(),
                ));
            }
            let sentinel_node = RedisConnectionInfo {
                username: info.sentinel_username.clone(),
                password: info.sentinel_password.clone(),
                ..Default::default()
            };
            let sentinels: Vec<ConnectionInfo> = info
                .addrs
                .iter()
                .map(|(host, port)| connection_info(host, *port, sentinel_node.clone()))
                .collect();
            let node = SentinelNodeConnectionInfo {
                redis_connection_info: Some(data_node),
                ..Default::default()
            };

            let mut client = SentinelClient::build(
                sentinels.clone(),
                info.master_name.clone(),
                Some(node.clone()),
                SentinelServerType::Master,
            )?;
            let connection = client.get_async_connection().await?;
            let sentinel = Sentinel::build(sentinels)?;
            Ok((
                CommandConnection::Sentinel(connection),
                PubSubSource::Sentinel {
                    sentinel: Mutex::new(sentinel),
                    master_name: info.master_name.clone(),
                    node,
                },
            ))
        },
        Topology::Cluster => {
            // Clusters only serve database 0.
            let cluster_node = RedisConnectionInfo { db: 0, ..data_node };
            let nodes: Vec<ConnectionInfo> = info
                .addrs
                .iter()
                .map(|(host, port)| connection_info(host, *port, cluster_node.clone()))
                .collect();
            let seed = nodes
                .first()
                .cloned()
                .ok_or_else(|| RedisRepositoryError::Descriptor("no address".into()))?;

            let mut builder = ClusterClientBuilder::new(nodes);
            if let Some(username) = &info.username {
                builder = builder.username(username.clone());
            }
            if let Some(password) = &info.password {
                builder = builder.password(password.clone());
            }
            let connection = builder.build()?.get_async_connection().await?;
            // Classic pub/sub messages are broadcast to every node.
            Ok((CommandConnection::Cluster(connection), PubSubSource::Direct(Client::open(seed)?)))
        },
    }
}
