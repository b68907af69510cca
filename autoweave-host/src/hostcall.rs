//! The host-call mediation layer.
//!
//! A hook calls a [`HostContext`] method; the argument is serialized into a
//! [`HostCall`] and sent over the mediation channel with a one-shot reply
//! slot. The service task on the host side maps the call to a capability
//! request, asks the permission evaluator, performs the privileged action,
//! and replies. The worker thread blocks on the reply with a bounded wait.
//!
//! Per-instance ordering is FIFO: one channel, one service task.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use autoweave_permissions::InboundInterface;

/// One privileged operation requested by a plugin.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    FsRead { path: PathBuf },
    FsWrite { path: PathBuf, bytes: Vec<u8> },
    HttpGet { url: String },
    NetBind { port: u16, interface: InboundInterface },
    UsbOpen { vendor_id: u16, product_id: u16 },
    QueuePublish { queue: String, fields: Vec<(String, String)> },
    MemoryAlloc { bytes: u64 },
    MemoryRelease { bytes: u64 },
    WorkerSpawn,
    WorkerExited,
    Log { level: LogLevel, message: String },
}

/// Reply to a host-call.
#[derive(Debug, Clone, PartialEq)]
pub enum HostReply {
    Ok,
    Bytes(Vec<u8>),
    Text(String),
    Device(serde_json::Value),
    Denied(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Errors surfaced to plugin code from a host-call.
#[derive(Debug, Error)]
pub enum HostCallError {
    /// The permission evaluator denied the capability request.
    #[error("permission denied: {0}")]
    Denied(String),

    /// The capability was granted but the privileged action failed.
    #[error("host operation failed: {0}")]
    Failed(String),

    /// The mediation channel is gone; the instance is being torn down.
    #[error("host-call channel closed")]
    ChannelClosed,

    /// No reply arrived within the bounded wait.
    #[error("host-call timed out")]
    Timeout,
}

pub(crate) struct HostCallEnvelope {
    pub call: HostCall,
    pub reply: std_mpsc::SyncSender<HostReply>,
}

/// The only surface a plugin can reach the outside world through.
///
/// Every method is synchronous from the worker thread's point of view and
/// round-trips the mediation channel. Methods return exactly what the host
/// decided; nothing here touches the filesystem, network, or bus directly.
pub struct HostContext {
    plugin: String,
    instance_id: Uuid,
    calls: mpsc::UnboundedSender<HostCallEnvelope>,
    call_timeout: Duration,
}

impl HostContext {
    pub(crate) fn new(
        plugin: String,
        instance_id: Uuid,
        calls: mpsc::UnboundedSender<HostCallEnvelope>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            plugin,
            instance_id,
            calls,
            call_timeout,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn call(&self, call: HostCall) -> Result<HostReply, HostCallError> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.calls
            .send(HostCallEnvelope {
                call,
                reply: reply_tx,
            })
            .map_err(|_| HostCallError::ChannelClosed)?;
        match reply_rx.recv_timeout(self.call_timeout) {
            Ok(HostReply::Denied(reason)) => Err(HostCallError::Denied(reason)),
            Ok(HostReply::Failed(reason)) => Err(HostCallError::Failed(reason)),
            Ok(reply) => Ok(reply),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(HostCallError::Timeout),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(HostCallError::ChannelClosed),
        }
    }

    /// Read a file under a declared filesystem prefix.
    pub fn read_file(&self, path: impl Into<PathBuf>) -> Result<Vec<u8>, HostCallError> {
        match self.call(HostCall::FsRead { path: path.into() })? {
            HostReply::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    /// Write a file under a declared filesystem prefix.
    pub fn write_file(
        &self,
        path: impl Into<PathBuf>,
        bytes: Vec<u8>,
    ) -> Result<(), HostCallError> {
        self.call(HostCall::FsWrite {
            path: path.into(),
            bytes,
        })
        .map(|_| ())
    }

    /// Claim the declared inbound listening port. The check is the
    /// gate; serving the socket is the plugin's own worker logic.
    pub fn bind_inbound(
        &self,
        port: u16,
        interface: InboundInterface,
    ) -> Result<(), HostCallError> {
        self.call(HostCall::NetBind { port, interface }).map(|_| ())
    }

    /// GET an allowlisted origin; returns the response body.
    pub fn http_get(&self, url: &str) -> Result<String, HostCallError> {
        match self.call(HostCall::HttpGet { url: url.into() })? {
            HostReply::Text(body) => Ok(body),
            other => Err(unexpected(other)),
        }
    }

    /// Open a USB device inside the declared vendor/product filter;
    /// returns its descriptor snapshot.
    pub fn open_usb_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<serde_json::Value, HostCallError> {
        match self.call(HostCall::UsbOpen {
            vendor_id,
            product_id,
        })? {
            HostReply::Device(descriptor) => Ok(descriptor),
            other => Err(unexpected(other)),
        }
    }

    /// Publish a job onto a declared queue.
    pub fn publish_job(
        &self,
        queue: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), HostCallError> {
        self.call(HostCall::QueuePublish {
            queue: queue.into(),
            fields,
        })
        .map(|_| ())
    }

    /// Account a heap allocation against the instance ceiling.
    pub fn alloc(&self, bytes: u64) -> Result<(), HostCallError> {
        self.call(HostCall::MemoryAlloc { bytes }).map(|_| ())
    }

    /// Release previously accounted bytes.
    pub fn release(&self, bytes: u64) -> Result<(), HostCallError> {
        self.call(HostCall::MemoryRelease { bytes }).map(|_| ())
    }

    /// Claim a worker slot below `maxWorkers`.
    pub fn spawn_worker(&self) -> Result<(), HostCallError> {
        self.call(HostCall::WorkerSpawn).map(|_| ())
    }

    /// Return a claimed worker slot.
    pub fn worker_exited(&self) -> Result<(), HostCallError> {
        self.call(HostCall::WorkerExited).map(|_| ())
    }

    /// Structured logging into the host subscriber, tagged with the plugin
    /// identity. Never fails; a torn-down channel just drops the line.
    pub fn log(&self, level: LogLevel, message: &str) {
        let _ = self.call(HostCall::Log {
            level,
            message: message.into(),
        });
    }
}

fn unexpected(reply: HostReply) -> HostCallError {
    HostCallError::Failed(format!("unexpected host reply {reply:?}"))
}

/// Emit a plugin log line into the host subscriber.
pub(crate) fn emit_plugin_log(plugin: &str, instance_id: Uuid, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => trace!(plugin, %instance_id, "{message}"),
        LogLevel::Debug => debug!(plugin, %instance_id, "{message}"),
        LogLevel::Info => info!(plugin, %instance_id, "{message}"),
        LogLevel::Warn => warn!(plugin, %instance_id, "{message}"),
        LogLevel::Error => error!(plugin, %instance_id, "{message}"),
    }
}
