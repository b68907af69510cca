//! In-process bus backend with Redis-Streams semantics.
//!
//! Used by tests and single-binary deployments. Entries live in a per-stream
//! append-only vector; consumer groups track a read cursor and a pending
//! set, exactly like the wire backend. A fault-injection switch lets tests
//! exercise the degraded publish path without a real outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{BusError, BusMessage, EventBus, StreamId};

#[derive(Default)]
struct GroupState {
    /// Index of the next entry this group has not yet delivered.
    cursor: usize,
    /// Delivered but not yet acknowledged.
    pending: HashMap<StreamId, ()>,
}

#[derive(Default)]
struct StreamInner {
    entries: Vec<(StreamId, HashMap<String, String>)>,
    last_id: Option<StreamId>,
    groups: HashMap<String, GroupState>,
}

/// An in-memory append-only log with consumer groups.
pub struct MemoryBus {
    streams: DashMap<String, Arc<Mutex<StreamInner>>>,
    appended: Notify,
    available: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Fault injection: while unavailable every operation returns
    /// [`BusError::Unavailable`], mimicking a backend outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total number of entries ever appended to a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|s| s.lock().entries.len())
            .unwrap_or(0)
    }

    /// All entries of a stream, oldest first. Test affordance.
    pub fn snapshot(&self, stream: &str) -> Vec<BusMessage> {
        self.streams
            .get(stream)
            .map(|s| {
                s.lock()
                    .entries
                    .iter()
                    .map(|(id, fields)| BusMessage {
                        stream: stream.to_string(),
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn stream(&self, name: &str) -> Arc<Mutex<StreamInner>> {
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamInner::default())))
            .clone()
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus marked unavailable".into()))
        }
    }

    fn next_id(inner: &StreamInner) -> StreamId {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        match inner.last_id {
            Some(last) if last.ms >= now_ms => StreamId {
                ms: last.ms,
                seq: last.seq + 1,
            },
            _ => StreamId { ms: now_ms, seq: 0 },
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<StreamId, BusError> {
        self.check_available()?;
        let state = self.stream(stream);
        let id = {
            let mut inner = state.lock();
            let id = Self::next_id(&inner);
            inner.last_id = Some(id);
            inner
                .entries
                .push((id, fields.iter().cloned().collect()));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        self.check_available()?;
        let state = self.stream(stream);
        let mut inner = state.lock();
        // Idempotent: an existing group keeps its cursor. A new group starts
        // at the current end of the stream, like XGROUP CREATE with `$`.
        let end = inner.entries.len();
        inner
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: end,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let _ = consumer;
        let deadline = Instant::now() + block;
        loop {
            self.check_available()?;
            let notified = self.appended.notified();

            {
                let state = self.stream(stream);
                let mut inner = state.lock();
                let total = inner.entries.len();
                let from = inner
                    .groups
                    .get(group)
                    .ok_or_else(|| BusError::Protocol(format!("unknown group `{group}`")))?
                    .cursor;
                if from < total {
                    let to = (from + count).min(total);
                    let messages: Vec<BusMessage> = inner.entries[from..to]
                        .iter()
                        .map(|(id, fields)| BusMessage {
                            stream: stream.to_string(),
                            id: *id,
                            fields: fields.clone(),
                        })
                        .collect();
                    if let Some(group_state) = inner.groups.get_mut(group) {
                        group_state.cursor = to;
                        for message in &messages {
                            group_state.pending.insert(message.id, ());
                        }
                    }
                    return Ok(messages);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<(), BusError> {
        self.check_available()?;
        let state = self.stream(stream);
        let mut inner = state.lock();
        if let Some(group_state) = inner.groups.get_mut(group) {
            group_state.pending.remove(&id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.check_available()
    }
}
