//! # AutoWeave Event Bus Adapter
//!
//! Append-only publisher/consumer over a Redis-Streams-compatible log with
//! consumer groups and acknowledgement. The bus is the source of truth for
//! every event in the system; nothing else is persisted.
//!
//! Two backends implement the same [`EventBus`] contract:
//!
//! - [`RedisStreamsBus`] — the production backend over Redis Streams.
//! - [`MemoryBus`] — an in-process log with identical semantics, used by
//!   tests and single-binary deployments.
//!
//! The contract required of any backend:
//!
//! - At-least-once delivery within a consumer group.
//! - Monotone stream ids within a stream.
//! - Durability for at least the configured publish timeout.
//!
//! Producers do not talk to a backend directly; they go through
//! [`BufferedPublisher`], which adds bounded in-memory buffering with an
//! oldest-drop overflow policy and a Degraded mode that rides out backend
//! outages while preserving publish order.

mod buffer;
mod memory;
mod redis_streams;
pub mod streams;

pub use buffer::{BufferedPublisher, PublisherConfig, PublisherCounters, PublisherHealth};
pub use memory::MemoryBus;
pub use redis_streams::{RedisConfig, RedisStreamsBus};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed error set for the bus subsystem.
#[derive(Debug, Error)]
pub enum BusError {
    /// The backend is unreachable or refused the operation.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something outside the stream contract.
    #[error("bus protocol error: {0}")]
    Protocol(String),
}

/// Identifier assigned by the bus on append: `<ms>-<seq>`, monotonically
/// increasing per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| BusError::Protocol(format!("malformed stream id `{s}`")))?;
        Ok(Self {
            ms: ms
                .parse()
                .map_err(|_| BusError::Protocol(format!("malformed stream id `{s}`")))?,
            seq: seq
                .parse()
                .map_err(|_| BusError::Protocol(format!("malformed stream id `{s}`")))?,
        })
    }
}

/// One appended entry as seen by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub stream: String,
    pub id: StreamId,
    pub fields: HashMap<String, String>,
}

/// The append-only log contract. All field values are strings, per the
/// stream wire format.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append fields to a stream; returns the assigned id.
    async fn publish(&self, stream: &str, fields: &[(String, String)])
        -> Result<StreamId, BusError>;

    /// Create a consumer group at the head of the stream. Idempotent.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Read new messages for a consumer inside a group, blocking up to
    /// `block` when the stream is empty.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Acknowledge a delivered message inside a group.
    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<(), BusError>;

    /// Liveness probe used by the startup gate and the degraded-mode
    /// reconnect loop.
    async fn ping(&self) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_round_trips() {
        let id = StreamId { ms: 1722500000123, seq: 7 };
        let parsed: StreamId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn stream_id_orders_by_ms_then_seq() {
        let a = StreamId { ms: 5, seq: 9 };
        let b = StreamId { ms: 6, seq: 0 };
        let c = StreamId { ms: 6, seq: 1 };
        assert!(a < b && b < c);
    }

    #[test]
    fn malformed_stream_id_is_protocol_error() {
        assert!(matches!(
            "not-an-id".parse::<StreamId>(),
            Err(BusError::Protocol(_))
        ));
    }
}
