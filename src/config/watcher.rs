//! File watcher for the engine configuration.
//!
//! Watches the directory containing the active config file and emits reload
//! events through a tokio watch channel. Uses debouncing so an editor's
//! write-then-rename shows up as one change.

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Event emitted when the watched configuration changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    /// The config file was written or replaced.
    Changed(PathBuf),
    /// Watcher encountered an error.
    Error(String),
}

impl ConfigChangeEvent {
    /// Returns true if this event should trigger a config reload.
    pub fn requires_reload(&self) -> bool {
        !matches!(self, ConfigChangeEvent::Error(_))
    }
}

/// Tuning for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for coalescing rapid changes.
    pub debounce_duration: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(500),
        }
    }
}

/// Handle to the running config watcher.
pub struct ConfigWatcherHandle {
    /// Receiver for config change events. Clone to fan out.
    pub events: watch::Receiver<Option<ConfigChangeEvent>>,
    /// Handle to the watcher task (dropping this stops the watcher).
    _task_handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcherHandle {
    /// Wait for the next config change event.
    pub async fn wait_for_change(&mut self) -> Option<ConfigChangeEvent> {
        // Skip the initial None value
        loop {
            if self.events.changed().await.is_err() {
                return None; // Sender dropped
            }
            let event = self.events.borrow().clone();
            if event.is_some() {
                return event;
            }
        }
    }
}

/// Start watching `config_path` for changes.
///
/// The parent directory is watched rather than the file itself: editors and
/// deploy tooling typically replace config files by rename, which would
/// otherwise orphan a file-level watch.
pub fn start_config_watcher(
    config_path: PathBuf,
    config: WatcherConfig,
) -> Result<ConfigWatcherHandle, notify::Error> {
    let (event_tx, event_rx) = watch::channel(None);
    let (notify_tx, notify_rx) = mpsc::channel();

    let mut debouncer = new_debouncer(config.debounce_duration, notify_tx)?;

    let watch_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if watch_dir.exists() {
        info!("Watching config directory: {}", watch_dir.display());
        debouncer
            .watcher()
            .watch(&watch_dir, notify::RecursiveMode::NonRecursive)?;
    } else {
        warn!(
            "Config directory does not exist, hot reload disabled: {}",
            watch_dir.display()
        );
    }

    let task_handle = tokio::task::spawn_blocking(move || {
        // Keep the debouncer alive for the lifetime of the task
        let _debouncer = debouncer;
        process_notify_events(notify_rx, event_tx, &config_path);
    });

    Ok(ConfigWatcherHandle {
        events: event_rx,
        _task_handle: task_handle,
    })
}

/// Pump events from the notify debouncer into the watch channel.
fn process_notify_events(
    rx: mpsc::Receiver<Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>>,
    tx: watch::Sender<Option<ConfigChangeEvent>>,
    config_path: &Path,
) {
    loop {
        match rx.recv() {
            Ok(Ok(events)) => {
                for event in events {
                    if !matches!(
                        event.kind,
                        DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                    ) {
                        continue;
                    }
                    if let Some(change) = classify_path(&event.path, config_path) {
                        debug!("Config change detected: {:?}", change);
                        if tx.send(Some(change)).is_err() {
                            info!("Config watcher receiver dropped, stopping");
                            return;
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                error!("File watcher error: {}", e);
                let _ = tx.send(Some(ConfigChangeEvent::Error(e.to_string())));
            }
            Err(_) => {
                info!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

/// Decide whether a changed path is the config file we care about.
fn classify_path(path: &Path, config_path: &Path) -> Option<ConfigChangeEvent> {
    if path == config_path {
        return Some(ConfigChangeEvent::Changed(path.to_path_buf()));
    }
    // Rename-in-place shows up under the directory watch with the final name.
    let changed_name = path.file_name()?;
    let config_name = config_path.file_name()?;
    if changed_name == config_name {
        return Some(ConfigChangeEvent::Changed(path.to_path_buf()));
    }
    None
}
