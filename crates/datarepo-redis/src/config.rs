//! Configuration for the Redis backend.
//!
//! [`RedisConfig`] carries the connection descriptor and key namespace
//! options. The descriptor is a semicolon-delimited, positional string:
//!
//! ```text
//! mode;name;masterName;sentinelUsername;sentinelPassword;username;password;dbIndex;addr1[,addr2,...]
//! ```
//!
//! It is parsed into a [`ServerInfo`] when the backend is constructed.

use std::{any::Any, fmt, str::FromStr};

use datarepo::{RepositoryConfig, RepositoryError, RepositoryResult, DEFAULT_SUBSCRIBER_BUFFER};
use serde::{Deserialize, Serialize};

use crate::{
    error::RedisRepositoryError,
    keys::{DEFAULT_KEY_PREFIX, DEFAULT_KEY_SEPARATOR},
};

/// Default port for single-node and cluster addresses.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default port for sentinel addresses.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

const DESCRIPTOR_FIELDS: usize = 9;

/// Configuration for [`RedisRepository`](crate::RedisRepository).
///
/// # Example
///
/// ```
/// use datarepo_redis::RedisConfig;
///
/// let config = RedisConfig::builder()
///     .connection_string("single;main;;;;;;0;localhost:6379")
///     .build()?;
/// assert_eq!(config.key_prefix(), "app");
/// assert_eq!(config.key_separator(), ":");
/// # Ok::<(), datarepo::RepositoryError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection descriptor.
    pub(crate) connection_string: String,

    /// Namespace prefix prepended to every key.
    #[serde(default = "default_key_prefix")]
    pub(crate) key_prefix: String,

    /// Separator between key parts.
    #[serde(default = "default_key_separator")]
    pub(crate) key_separator: String,

    /// Capacity of each subscription's message buffer.
    #[serde(default = "default_subscriber_buffer")]
    pub(crate) subscriber_buffer: usize,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

fn default_key_separator() -> String {
    DEFAULT_KEY_SEPARATOR.to_owned()
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

#[bon::bon]
impl RedisConfig {
    /// Creates a new configuration, validating the namespace options.
    ///
    /// # Optional Fields
    ///
    /// * `key_prefix` - Namespace prefix (default: `"app"`).
    /// * `key_separator` - Key part separator (default: `":"`).
    /// * `subscriber_buffer` - Per-subscription buffer (default: 100).
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidInput`]
    /// if the prefix or separator is empty or malformed, or the buffer is zero.
    #[builder]
    pub fn new(
        #[builder(into)] connection_string: String,
        #[builder(into, default = default_key_prefix())] key_prefix: String,
        #[builder(into, default = default_key_separator())] key_separator: String,
        #[builder(default = DEFAULT_SUBSCRIBER_BUFFER)] subscriber_buffer: usize,
    ) -> RepositoryResult<Self> {
        let config = Self { connection_string, key_prefix, key_separator, subscriber_buffer };
        config.validate()?;
        Ok(config)
    }

    /// Returns the connection descriptor.
    #[must_use]
    pub fn connection_descriptor(&self) -> &str {
        &self.connection_string
    }

    /// Returns the namespace prefix.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Returns the key separator.
    #[must_use]
    pub fn key_separator(&self) -> &str {
        &self.key_separator
    }

    /// Returns the per-subscription buffer capacity.
    #[must_use]
    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }

    /// Checks the namespace options.
    ///
    /// Deserialized configs skip the builder, so the backend calls this
    /// again before connecting.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidInput`]
    /// describing the first invalid option.
    pub fn validate(&self) -> RepositoryResult<()> {
        let is_key_text = |text: &str| {
            !text.is_empty()
                && text
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | ':' | '.' | '-'))
        };
        if !is_key_text(&self.key_prefix) {
            return Err(RepositoryError::invalid_input(format!(
                "invalid key prefix {:?}",
                self.key_prefix
            )));
        }
        if !is_key_text(&self.key_separator) {
            return Err(RepositoryError::invalid_input(format!(
                "invalid key separator {:?}",
                self.key_separator
            )));
        }
        if self.key_prefix.contains(self.key_separator.as_str()) {
            return Err(RepositoryError::invalid_input(
                "key prefix must not contain the key separator",
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(RepositoryError::invalid_input("subscriber_buffer must be non-zero"));
        }
        Ok(())
    }

    /// Parses the connection descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidInput`]
    /// if the descriptor is malformed.
    pub fn server_info(&self) -> RepositoryResult<ServerInfo> {
        self.connection_string.parse()
    }
}

impl RepositoryConfig for RedisConfig {
    fn connection_string(&self) -> String {
        self.connection_string.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn descriptor_error(message: impl Into<String>) -> RepositoryError {
    RedisRepositoryError::Descriptor(message.into()).into()
}

/// Deployment shape of the Redis servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One server.
    Single,
    /// A master located through sentinels.
    Sentinel,
    /// A Redis Cluster.
    Cluster,
}

impl Topology {
    /// Returns the descriptor keyword for this topology.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Sentinel => "sentinel",
            Self::Cluster => "cluster",
        }
    }

    /// Port assumed when an address omits one.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Sentinel => DEFAULT_SENTINEL_PORT,
            Self::Single | Self::Cluster => DEFAULT_REDIS_PORT,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "sentinel" => Ok(Self::Sentinel),
            "cluster" => Ok(Self::Cluster),
            other => Err(descriptor_error(format!("unsupported redis mode: {other:?}"))),
        }
    }
}

/// A parsed connection descriptor.
///
/// Empty credential fields become `None`. Passwords are redacted from the
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Deployment shape.
    pub topology: Topology,
    /// Descriptive name of the deployment.
    pub name: String,
    /// Sentinel service name of the master.
    pub master_name: String,
    /// Username for authenticating against sentinels.
    pub sentinel_username: Option<String>,
    /// Password for authenticating against sentinels.
    pub sentinel_password: Option<String>,
    /// Username for authenticating against data nodes.
    pub username: Option<String>,
    /// Password for authenticating against data nodes.
    pub password: Option<String>,
    /// Logical database index. Ignored by clusters.
    pub db: i64,
    /// Seed addresses as `(host, port)`.
    pub addrs: Vec<(String, u16)>,
}

impl fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("ServerInfo")
            .field("topology", &self.topology)
            .field("name", &self.name)
            .field("master_name", &self.master_name)
            .field("sentinel_username", &self.sentinel_username)
            .field("sentinel_password", &redact(&self.sentinel_password))
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("db", &self.db)
            .field("addrs", &self.addrs)
            .finish()
    }
}

fn non_empty(field: &str) -> Option<String> {
    (!field.is_empty()).then(|| field.to_owned())
}

fn parse_addr(addr: &str, default_port: u16) -> RepositoryResult<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| descriptor_error(format!("invalid port in address {addr:?}")))?;
            Ok((host.to_owned(), port))
        },
        Some(_) => Err(descriptor_error(format!("missing host in address {addr:?}"))),
        None => Ok((addr.to_owned(), default_port)),
    }
}

impl FromStr for ServerInfo {
    type Err = RepositoryError;

    fn from_str(descriptor: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = descriptor.split(';').collect();
        if fields.len() < DESCRIPTOR_FIELDS {
            return Err(descriptor_error(format!(
                "expected {DESCRIPTOR_FIELDS} fields, found {}",
                fields.len()
            )));
        }

        let topology: Topology = fields[0].parse()?;
        let addrs = fields[8]
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(|addr| parse_addr(addr, topology.default_port()))
            .collect::<RepositoryResult<Vec<_>>>()?;
        if addrs.is_empty() {
            return Err(descriptor_error("at least one address is required"));
        }

        Ok(Self {
            topology,
            name: fields[1].to_owned(),
            master_name: fields[2].to_owned(),
            sentinel_username: non_empty(fields[3]),
            sentinel_password: non_empty(fields[4]),
            username: non_empty(fields[5]),
            password: non_empty(fields[6]),
            db: fields[7].trim().parse().unwrap_or(0),
            addrs,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use datarepo::downcast_config;
    use rstest::rstest;

    use super::*;

    const SINGLE: &str = "single;main;;;;;;0;localhost:6379";

    #[test]
    fn test_builder_defaults() {
        let config = RedisConfig::builder().connection_string(SINGLE).build().unwrap();
        assert_eq!(config.key_prefix(), DEFAULT_KEY_PREFIX);
        assert_eq!(config.key_separator(), DEFAULT_KEY_SEPARATOR);
        assert_eq!(config.subscriber_buffer(), DEFAULT_SUBSCRIBER_BUFFER);
        assert_eq!(config.connection_string(), SINGLE);
        assert!(downcast_config::<RedisConfig>(&config).is_ok());
    }

    #[rstest]
    #[case::empty_prefix("", ":", 10)]
    #[case::empty_separator("app", "", 10)]
    #[case::prefix_with_space("my app", ":", 10)]
    #[case::separator_slash("app", "/", 10)]
    #[case::prefix_contains_separator("app.v2", ".", 10)]
    #[case::zero_buffer("app", ":", 0)]
    fn test_builder_rejects(
        #[case] prefix: &str,
        #[case] separator: &str,
        #[case] buffer: usize,
    ) {
        let result = RedisConfig::builder()
            .connection_string(SINGLE)
            .key_prefix(prefix)
            .key_separator(separator)
            .subscriber_buffer(buffer)
            .build();
        assert!(result.unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RedisConfig =
            serde_json::from_str(&format!(r#"{{"connection_string":"{SINGLE}"}}"#)).unwrap();
        assert_eq!(config.key_prefix(), "app");
        assert!(config.validate().is_ok());

        let result = serde_json::from_str::<RedisConfig>(r#"{"connection_string":"x","ttl":"1s"}"#);
        assert!(result.is_err(), "unknown fields must be rejected");
    }

    #[test]
    fn test_parse_single() {
        let info: ServerInfo = "single;main;;;;bob;secret;2;localhost:6380".parse().unwrap();
        assert_eq!(info.topology, Topology::Single);
        assert_eq!(info.name, "main");
        assert_eq!(info.username.as_deref(), Some("bob"));
        assert_eq!(info.password.as_deref(), Some("secret"));
        assert_eq!(info.sentinel_username, None);
        assert_eq!(info.db, 2);
        assert_eq!(info.addrs, vec![("localhost".to_owned(), 6380)]);
    }

    #[test]
    fn test_parse_sentinel_defaults_port() {
        let info: ServerInfo =
            "sentinel;ha;mymaster;suser;spass;;;0;s1,s2:26380".parse().unwrap();
        assert_eq!(info.topology, Topology::Sentinel);
        assert_eq!(info.master_name, "mymaster");
        assert_eq!(info.sentinel_username.as_deref(), Some("suser"));
        assert_eq!(info.sentinel_password.as_deref(), Some("spass"));
        assert_eq!(info.addrs, vec![("s1".to_owned(), 26379), ("s2".to_owned(), 26380)]);
    }

    #[test]
    fn test_parse_cluster_multiple_addrs() {
        let info: ServerInfo = "cluster;c;;;;;;0;n1:7000, n2:7001 ,n3".parse().unwrap();
        assert_eq!(info.topology, Topology::Cluster);
        assert_eq!(
            info.addrs,
            vec![("n1".to_owned(), 7000), ("n2".to_owned(), 7001), ("n3".to_owned(), 6379)]
        );
    }

    #[test]
    fn test_unparsable_db_defaults_to_zero() {
        let info: ServerInfo = "single;main;;;;;;not-a-number;localhost".parse().unwrap();
        assert_eq!(info.db, 0);
    }

    #[rstest]
    #[case::too_few_fields("single;main;;;;;;0")]
    #[case::unknown_mode("replica;main;;;;;;0;localhost")]
    #[case::empty_addrs("single;main;;;;;;0;")]
    #[case::only_commas("cluster;c;;;;;;0; , ,")]
    #[case::bad_port("single;main;;;;;;0;localhost:redis")]
    #[case::missing_host("single;main;;;;;;0;:6379")]
    #[case::empty("")]
    fn test_parse_rejects(#[case] descriptor: &str) {
        let err = descriptor.parse::<ServerInfo>().unwrap_err();
        assert!(err.is_invalid_input(), "descriptor {descriptor:?} gave {err:?}");
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let info: ServerInfo = "sentinel;ha;m;su;sp;u;hunter2;0;s1".parse().unwrap();
        let debug = format!("{info:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("\"sp\""));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_topology_round_trip() {
        for topology in [Topology::Single, Topology::Sentinel, Topology::Cluster] {
            assert_eq!(topology.as_str().parse::<Topology>().unwrap(), topology);
        }
    }
}
