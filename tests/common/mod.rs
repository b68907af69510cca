//! Shared harness for the end-to-end tests: an assembled runtime over the
//! in-process bus and the scriptable USB backend, with a recording plugin
//! entry that mirrors the scanner plugin used throughout the scenarios.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use autoweave_bus::streams::{
    EventSource, HotplugRecord, LifecycleRecord, HOTPLUG_STREAM, PLUGIN_STREAM,
};
use autoweave_bus::MemoryBus;
use autoweave_core::{AutoWeaveConfig, AutoWeaveRuntime};
use autoweave_host::{EntryRegistry, HookTable, PluginEntry};
use autoweave_manifest::{sign_manifest_value, DEFAULT_DENYLIST, MANIFEST_FILE_NAME};
use autoweave_usb::{MockBackend, MockDevice, UsbBackend};

pub type Calls = Arc<Mutex<Vec<String>>>;

pub const SCANNER_PLUGIN: &str = "usb-scanner-plugin";

pub fn scanner_device() -> MockDevice {
    MockDevice::new(0x04a9, 0x220e, 1, 5).with_strings("Canon", "CanoScan LiDE", "SCN-0042")
}

pub fn keyboard_device() -> MockDevice {
    MockDevice::new(0x03f0, 0x0c17, 1, 7).with_strings("HP", "USB Keyboard", "KB-7")
}

struct RecordingEntry {
    calls: Calls,
    onload_sleep: Option<Duration>,
}

impl PluginEntry for RecordingEntry {
    fn register_hooks(&mut self, table: &mut HookTable) -> anyhow::Result<()> {
        let calls = Arc::clone(&self.calls);
        let sleep = self.onload_sleep;
        table.register("initialize", move |_ctx, _payload| {
            if let Some(duration) = sleep {
                std::thread::sleep(duration);
            }
            calls.lock().unwrap().push("initialize".into());
            Ok(())
        });
        let calls = Arc::clone(&self.calls);
        table.register("handleScannerAttach", move |_ctx, payload| {
            let signature = payload["device_signature"].as_str().unwrap_or("?");
            calls.lock().unwrap().push(format!("attach:{signature}"));
            Ok(())
        });
        let calls = Arc::clone(&self.calls);
        table.register("handleScannerDetach", move |_ctx, payload| {
            let signature = payload["device_signature"].as_str().unwrap_or("?");
            calls.lock().unwrap().push(format!("detach:{signature}"));
            Ok(())
        });
        let calls = Arc::clone(&self.calls);
        table.register("teardown", move |_ctx, _payload| {
            calls.lock().unwrap().push("teardown".into());
            Ok(())
        });
        Ok(())
    }
}

pub fn scanner_manifest() -> serde_json::Value {
    json!({
        "name": SCANNER_PLUGIN,
        "version": "1.0.0",
        "description": "Bridges Canon document scanners onto the job queue",
        "author": { "name": "AutoWeave Team", "email": "plugins@autoweave.dev" },
        "entry": "entry.bin",
        "permissions": {
            "usb": { "vendorIds": ["0x04A9"], "productIds": ["0x220E"] },
            "memory": { "maxHeapMB": 64, "maxWorkers": 1 },
            "queues": ["scanner-jobs"]
        },
        "hooks": {
            "onLoad": "initialize",
            "onUnload": "teardown",
            "onUSBAttach": "handleScannerAttach",
            "onUSBDetach": "handleScannerDetach"
        },
        "signature": {
            "algorithm": "SHA-256",
            "value": "0".repeat(64),
            "signer": "release-bot@autoweave.dev"
        }
    })
}

/// Write (or rewrite) the scanner plugin directory with a freshly signed
/// manifest covering `entry_bytes`.
pub fn write_scanner_plugin(plugin_root: &Path, entry_bytes: &[u8]) {
    let dir = plugin_root.join(SCANNER_PLUGIN);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("entry.bin"), entry_bytes).unwrap();
    let signed = sign_manifest_value(scanner_manifest(), &dir, DEFAULT_DENYLIST).unwrap();
    std::fs::write(dir.join(MANIFEST_FILE_NAME), signed.to_string()).unwrap();
}

#[derive(Default)]
pub struct HarnessOptions {
    pub onload_sleep: Option<Duration>,
    pub onload_timeout: Option<Duration>,
    pub publisher_capacity: Option<usize>,
    /// Flip one byte of the entry file after signing.
    pub tamper_entry: bool,
    pub skip_plugin: bool,
}

pub struct Harness {
    pub runtime: AutoWeaveRuntime,
    pub bus: Arc<MemoryBus>,
    pub backend: Arc<MockBackend>,
    pub calls: Calls,
    pub plugin_root: tempfile::TempDir,
}

/// Assemble (but do not start) a runtime over the memory bus and mock USB
/// backend.
pub fn harness(options: HarnessOptions) -> Harness {
    let plugin_root = tempfile::tempdir().unwrap();
    if !options.skip_plugin {
        write_scanner_plugin(plugin_root.path(), b"payload-v1");
        if options.tamper_entry {
            std::fs::write(
                plugin_root.path().join(SCANNER_PLUGIN).join("entry.bin"),
                b"qayload-v1",
            )
            .unwrap();
        }
    }

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(EntryRegistry::new());
    let entry_calls = Arc::clone(&calls);
    let onload_sleep = options.onload_sleep;
    registry.register(SCANNER_PLUGIN, move || {
        Box::new(RecordingEntry {
            calls: Arc::clone(&entry_calls),
            onload_sleep,
        })
    });

    let mut config = AutoWeaveConfig::default();
    config.loader.plugin_dir = plugin_root.path().to_path_buf();
    // Reloads are driven explicitly in these scenarios; a long debounce
    // keeps the watcher from firing a second, racing reload.
    config.loader.reload_debounce = Duration::from_secs(60);
    if let Some(timeout) = options.onload_timeout {
        config.loader.onload_timeout = timeout;
    }
    config.publisher.retry_interval = Duration::from_millis(20);
    if let Some(capacity) = options.publisher_capacity {
        config.publisher.capacity = capacity;
    }

    let backend = Arc::new(MockBackend::new(EventSource::Primary));
    let (runtime, bus) = AutoWeaveRuntime::in_memory(
        config,
        registry,
        backend.clone() as Arc<dyn UsbBackend>,
        None,
    );

    Harness {
        runtime,
        bus,
        backend,
        calls,
        plugin_root,
    }
}

impl Harness {
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.call_log()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub async fn wait_for_call_count(&self, prefix: &str, count: usize) {
        for _ in 0..400 {
            if self.calls_matching(prefix) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} `{prefix}` calls, saw {:?}",
            self.call_log()
        );
    }
}

pub async fn hotplug_events(bus: &MemoryBus, count: usize) -> Vec<HotplugRecord> {
    wait_for_stream(bus, HOTPLUG_STREAM, count).await;
    bus.snapshot(HOTPLUG_STREAM)
        .iter()
        .map(|m| HotplugRecord::from_fields(&m.fields).unwrap())
        .collect()
}

pub async fn lifecycle_events(bus: &MemoryBus, count: usize) -> Vec<LifecycleRecord> {
    wait_for_stream(bus, PLUGIN_STREAM, count).await;
    bus.snapshot(PLUGIN_STREAM)
        .iter()
        .map(|m| LifecycleRecord::from_fields(&m.fields).unwrap())
        .collect()
}

async fn wait_for_stream(bus: &MemoryBus, stream: &str, count: usize) {
    for _ in 0..400 {
        if bus.stream_len(stream) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {count} entries on {stream}, found {}",
        bus.stream_len(stream)
    );
}
