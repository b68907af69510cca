//! Redis Streams backend.
//!
//! Raw commands (`XADD`, `XGROUP`, `XREADGROUP`, `XACK`) over a multiplexed
//! async connection. The connection is cloneable and multiplexes requests,
//! so every operation clones it rather than holding a lock across awaits.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use tracing::info;

use crate::{BusError, BusMessage, EventBus, StreamId};

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    fn connection_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Production bus backend over Redis Streams.
pub struct RedisStreamsBus {
    connection: MultiplexedConnection,
}

impl RedisStreamsBus {
    /// Open a multiplexed connection to the configured Redis server.
    pub async fn connect(config: &RedisConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.connection_url())
            .map_err(|e| BusError::Unavailable(format!("bad redis config: {e}")))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        info!(host = %config.host, port = config.port, db = config.db, "connected to redis");
        Ok(Self { connection })
    }

    fn map_err(e: redis::RedisError) -> BusError {
        if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
            BusError::Unavailable(e.to_string())
        } else {
            BusError::Protocol(e.to_string())
        }
    }
}

#[async_trait]
impl EventBus for RedisStreamsBus {
    async fn publish(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<StreamId, BusError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        id.parse()
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // The group already existing is the idempotent success case.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        // BLOCK 0 would block forever in Redis; a zero timeout means a
        // non-blocking read in this contract.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        let reply: Option<StreamReadReply> = cmd
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let id: StreamId = entry.id.parse()?;
                let mut fields = std::collections::HashMap::new();
                for (name, value) in entry.map {
                    let value: String = redis::from_redis_value(&value)
                        .map_err(|e| BusError::Protocol(format!("non-string field: {e}")))?;
                    fields.insert(name, value);
                }
                messages.push(BusMessage {
                    stream: key.key.clone(),
                    id,
                    fields,
                });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BusError::Protocol(format!("unexpected PING reply `{pong}`")))
        }
    }
}
