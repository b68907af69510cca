//! Worker-thread side of an instance: the command loop and hook dispatch.

use std::sync::atomic::AtomicU32;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use autoweave_manifest::HooksDecl;
use autoweave_permissions::PermissionEvaluator;

use crate::entry::{HookPayload, HookTable, PluginEntry};
use crate::hostcall::HostContext;

/// The five lifecycle/event points the host can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    OnLoad,
    OnUnload,
    OnUsbAttach,
    OnUsbDetach,
    OnJobReceived,
}

impl HookKind {
    /// The symbolic handler name the manifest declares for this point, if
    /// any. An undeclared hook is simply never invoked.
    pub fn resolve(self, hooks: &HooksDecl) -> Option<&String> {
        match self {
            HookKind::OnLoad => hooks.on_load.as_ref(),
            HookKind::OnUnload => hooks.on_unload.as_ref(),
            HookKind::OnUsbAttach => hooks.on_usb_attach.as_ref(),
            HookKind::OnUsbDetach => hooks.on_usb_detach.as_ref(),
            HookKind::OnJobReceived => hooks.on_job_received.as_ref(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HookKind::OnLoad => "onLoad",
            HookKind::OnUnload => "onUnload",
            HookKind::OnUsbAttach => "onUSBAttach",
            HookKind::OnUsbDetach => "onUSBDetach",
            HookKind::OnJobReceived => "onJobReceived",
        }
    }
}

pub(crate) enum WorkerCommand {
    Invoke {
        hook: String,
        payload: HookPayload,
        done: oneshot::Sender<Result<(), String>>,
    },
    Shutdown,
}

/// Host-side record of one live worker.
pub(crate) struct WorkerHandle {
    pub instance_id: Uuid,
    pub plugin: String,
    pub version: String,
    pub hooks: HooksDecl,
    pub evaluator: Arc<PermissionEvaluator>,
    /// `None` once the worker is terminating; commands can no longer be
    /// enqueued.
    pub cmd_tx: Mutex<Option<std_mpsc::Sender<WorkerCommand>>>,
    pub thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    pub service: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Consecutive hook timeouts; reset on any successful hook.
    pub timeout_strikes: AtomicU32,
}

impl WorkerHandle {
    /// Enqueue a hook invocation. FIFO with every other command for this
    /// instance. Returns `false` when the worker is already terminating.
    pub fn enqueue(
        &self,
        hook: String,
        payload: HookPayload,
        done: oneshot::Sender<Result<(), String>>,
    ) -> bool {
        let guard = self.cmd_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(WorkerCommand::Invoke { hook, payload, done }).is_ok(),
            None => false,
        }
    }

    /// Stop the worker. Graceful shutdown lets the command loop drain;
    /// forced shutdown drops the channel out from under it. Either way the
    /// thread is given a bounded join and abandoned if it will not exit —
    /// a hook stuck in an infinite loop cannot hold up the host.
    pub async fn shutdown(&self, forced: bool) {
        {
            let mut guard = self.cmd_tx.lock();
            if let Some(tx) = guard.take() {
                if !forced {
                    let _ = tx.send(WorkerCommand::Shutdown);
                }
            }
        }
        let service = self.service.lock().take();
        if let Some(service) = service {
            service.abort();
            let _ = service.await;
        }
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let joined = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                tokio::task::spawn_blocking(move || thread.join()),
            )
            .await;
            if joined.is_err() {
                debug!(
                    plugin = %self.plugin,
                    instance_id = %self.instance_id,
                    "worker thread did not exit in time, abandoning"
                );
            }
        }
    }
}

/// The worker thread body: publish the hook table, then serve commands
/// until shutdown. Nothing host-side is reachable from here except `ctx`.
pub(crate) fn worker_main(
    mut entry: Box<dyn PluginEntry>,
    ctx: HostContext,
    cmd_rx: std_mpsc::Receiver<WorkerCommand>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut table = HookTable::new();
    if let Err(e) = entry.register_hooks(&mut table) {
        let _ = ready.send(Err(e.to_string()));
        return;
    }
    let _ = ready.send(Ok(()));

    while let Ok(command) = cmd_rx.recv() {
        match command {
            WorkerCommand::Invoke { hook, payload, done } => {
                let result = match table.invoke(&hook, &ctx, &payload) {
                    None => Err(format!("hook `{hook}` is not registered by the entry")),
                    Some(Ok(())) => Ok(()),
                    Some(Err(e)) => Err(e.to_string()),
                };
                let _ = done.send(result);
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!(plugin = %ctx.plugin_name(), instance_id = %ctx.instance_id(), "worker loop exited");
}
