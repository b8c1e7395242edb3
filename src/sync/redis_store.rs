//! Counter store client speaking the Redis request/reply protocol.

use async_trait::async_trait;
use redis::ConnectionAddr;
use redis::ConnectionInfo;
use redis::RedisConnectionInfo;
use redis::aio::MultiplexedConnection;
use snafu::ResultExt;
use tracing::debug;

use super::store::CounterConnection;
use super::store::CounterKey;
use super::store::CounterReply;
use super::store::CounterStore;
use crate::constants::RECOMPUTE_REQUEST_VALUE;
use crate::error::CommandSnafu;
use crate::error::ConnectSnafu;
use crate::error::InvalidAddressSnafu;
use crate::error::RemoteStoreError;

/// Counter store reached over TCP.
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    /// Prepare a client for `host:port`. No connection is made here.
    pub fn new(host: &str, port: u16) -> Result<Self, RemoteStoreError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo::default(),
        };
        let client = redis::Client::open(info).context(InvalidAddressSnafu { host, port })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn connect(&self) -> Result<Box<dyn CounterConnection>, RemoteStoreError> {
        let conn = self.client.get_multiplexed_async_connection().await.context(ConnectSnafu)?;
        Ok(Box::new(RedisCounterConnection { conn }))
    }
}

struct RedisCounterConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl CounterConnection for RedisCounterConnection {
    async fn authenticate(&mut self, secret: &str) -> Result<(), RemoteStoreError> {
        let _: redis::Value =
            redis::cmd("AUTH").arg(secret).query_async(&mut self.conn).await.context(CommandSnafu { command: "AUTH" })?;
        Ok(())
    }

    async fn set_flag(&mut self, key: &CounterKey) -> Result<(), RemoteStoreError> {
        let hash = key.request_hash();
        debug!(hash = %hash, field = key.field(), "HSET recompute request");

        let _: redis::Value = redis::cmd("HSET")
            .arg(&hash)
            .arg(key.field())
            .arg(RECOMPUTE_REQUEST_VALUE)
            .query_async(&mut self.conn)
            .await
            .context(CommandSnafu { command: "HSET" })?;
        Ok(())
    }

    async fn get_counter(&mut self, key: &CounterKey) -> Result<CounterReply, RemoteStoreError> {
        let hash = key.usage_hash();
        let value: redis::Value = redis::cmd("HGET")
            .arg(&hash)
            .arg(key.field())
            .query_async(&mut self.conn)
            .await
            .context(CommandSnafu { command: "HGET" })?;

        Ok(match value {
            redis::Value::Int(n) => CounterReply::Integer(n),
            other => CounterReply::NotInteger(format!("{other:?}")),
        })
    }
}
