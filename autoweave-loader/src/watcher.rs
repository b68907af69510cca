//! Plugin-directory watching with per-plugin change coalescing.
//!
//! Editors and build tools touch many files in a burst; every change event
//! under a plugin directory refreshes that plugin's debounce deadline, and
//! the reload fires once the directory has been quiet for the window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::LoaderError;

/// Handle keeping the OS watcher and the coalescing task alive.
pub(crate) struct DirectoryWatcher {
    // Dropping the watcher stops the notification stream.
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Watch `root` recursively; emits the name of a changed plugin
    /// directory onto `reloads` after its burst has settled.
    pub fn spawn(
        root: PathBuf,
        debounce: Duration,
        reloads: mpsc::UnboundedSender<String>,
    ) -> Result<Self, LoaderError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "plugin directory watch error"),
            }
        })
        .map_err(|e| LoaderError::Watch(e.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| LoaderError::Watch(e.to_string()))?;

        let task = tokio::spawn(async move {
            let mut pending: HashMap<String, Instant> = HashMap::new();
            loop {
                let next_deadline = pending.values().min().copied();
                tokio::select! {
                    event = raw_rx.recv() => {
                        let Some(event) = event else { break };
                        for path in &event.paths {
                            if let Some(plugin) = plugin_dir_of(&root, path) {
                                pending.insert(plugin, Instant::now() + debounce);
                            }
                        }
                    }
                    _ = sleep_until_or_forever(next_deadline) => {
                        let now = Instant::now();
                        let due: Vec<String> = pending
                            .iter()
                            .filter(|(_, deadline)| **deadline <= now)
                            .map(|(plugin, _)| plugin.clone())
                            .collect();
                        for plugin in due {
                            pending.remove(&plugin);
                            debug!(plugin, "plugin directory settled, requesting reload");
                            if reloads.send(plugin).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The plugin directory a changed path belongs to: the first component
/// under the watch root.
fn plugin_dir_of(root: &Path, changed: &Path) -> Option<String> {
    let relative = changed.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    match first {
        std::path::Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_dir_is_first_component_under_root() {
        let root = Path::new("/plugins");
        assert_eq!(
            plugin_dir_of(root, Path::new("/plugins/usb-scanner-plugin/src/index.bin")),
            Some("usb-scanner-plugin".to_string())
        );
        assert_eq!(plugin_dir_of(root, Path::new("/plugins")), None);
        assert_eq!(plugin_dir_of(root, Path::new("/elsewhere/x")), None);
    }

    #[tokio::test]
    async fn bursts_coalesce_into_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("usb-scanner-plugin");
        std::fs::create_dir_all(&plugin_dir).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher =
            DirectoryWatcher::spawn(dir.path().to_path_buf(), Duration::from_millis(100), tx)
                .unwrap();

        for i in 0..5 {
            std::fs::write(plugin_dir.join(format!("file-{i}")), b"x").unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let plugin = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("reload within deadline")
            .expect("channel open");
        assert_eq!(plugin, "usb-scanner-plugin");

        // The burst must have collapsed to a single reload request.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        watcher.shutdown().await;
    }
}
