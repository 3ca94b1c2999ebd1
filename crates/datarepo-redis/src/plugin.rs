//! Raw command access for callers that need Redis features outside the
//! common contract.

use async_trait::async_trait;
use datarepo::{RepositoryError, RepositoryPlugin, RepositoryResult};
use redis::{Cmd, Value as RedisValue};
use serde_json::{Map, Number, Value};

use crate::{connection::CommandConnection, error::RedisRepositoryError};

/// Name the raw command plugin is registered under.
pub const REDIS_COMMAND_PLUGIN: &str = "redis.command";

/// Sends arbitrary commands on the repository's command connection.
///
/// Arguments are JSON values: strings and numbers are sent as-is, booleans
/// as `1`/`0`, arrays and objects as JSON text. The reply is converted back
/// to JSON.
///
/// ```no_run
/// # async fn demo(repo: &dyn datarepo::DataRepository) -> datarepo::RepositoryResult<()> {
/// use serde_json::json;
///
/// let plugin = repo.get_plugin("redis.command").expect("redis backend");
/// let reply = plugin.execute("HSET", &[json!("app:hash:1"), json!("field"), json!(7)]).await?;
/// assert_eq!(reply, json!(1));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedisCommandPlugin {
    connection: CommandConnection,
}

impl RedisCommandPlugin {
    pub(crate) fn new(connection: CommandConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl RepositoryPlugin for RedisCommandPlugin {
    fn name(&self) -> &str {
        REDIS_COMMAND_PLUGIN
    }

    #[tracing::instrument(name = "plugin_execute", skip_all, fields(plugin = REDIS_COMMAND_PLUGIN, command = %command))]
    async fn execute(&self, command: &str, args: &[Value]) -> RepositoryResult<Value> {
        let cmd = build_command(command, args)?;
        let reply: RedisValue =
            self.connection.query(&cmd).await.map_err(RedisRepositoryError::from)?;
        Ok(reply_to_json(reply))
    }
}

fn build_command(command: &str, args: &[Value]) -> RepositoryResult<Cmd> {
    if command.trim().is_empty() {
        return Err(RepositoryError::invalid_input("command must not be empty"));
    }
    let mut cmd = redis::cmd(command);
    for (position, arg) in args.iter().enumerate() {
        match arg {
            Value::String(text) => cmd.arg(text),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    cmd.arg(int)
                } else if let Some(uint) = number.as_u64() {
                    cmd.arg(uint)
                } else {
                    cmd.arg(number.as_f64().unwrap_or_default())
                }
            },
            Value::Bool(flag) => cmd.arg(i64::from(*flag)),
            Value::Array(_) | Value::Object(_) => cmd.arg(arg.to_string()),
            Value::Null => {
                return Err(RepositoryError::invalid_input(format!(
                    "argument {position} is null"
                )));
            },
        };
    }
    Ok(cmd)
}

fn reply_to_json(reply: RedisValue) -> Value {
    match reply {
        RedisValue::Nil => Value::Null,
        RedisValue::Int(int) => Value::from(int),
        RedisValue::BulkString(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        RedisValue::SimpleString(text) => Value::String(text),
        RedisValue::Okay => Value::String("OK".to_owned()),
        RedisValue::Array(items) | RedisValue::Set(items) => {
            Value::Array(items.into_iter().map(reply_to_json).collect())
        },
        RedisValue::Map(pairs) => {
            let object: Map<String, Value> = pairs
                .into_iter()
                .map(|(key, value)| {
                    let key = match reply_to_json(key) {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (key, reply_to_json(value))
                })
                .collect();
            Value::Object(object)
        },
        RedisValue::Double(float) => Number::from_f64(float).map_or(Value::Null, Value::Number),
        RedisValue::Boolean(flag) => Value::Bool(flag),
        other => Value::String(format!("{other:?}")),
    }
}
