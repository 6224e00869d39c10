//! External modification watcher for the settings document.
//!
//! Filesystem events go from the `notify` callback thread into a channel;
//! a tokio task debounces them and runs reconciliation once they settle.
//! Events are dropped while a write is in flight or shortly after the
//! store's own write, so the store does not react to itself.

use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::persistence::WriteGate;

/// Quiet period after the last qualifying event before reconciling.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

/// Events within this long after the store's own write are ignored.
pub const OWN_WRITE_QUIESCENCE: Duration = Duration::from_secs(1);

const EVENT_BUFFER_SIZE: usize = 64;

/// Receiver of settled change events.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self);
}

enum WatchState {
    Idle,
    Armed {
        // Dropping the watcher stops the event feed.
        _watcher: RecommendedWatcher,
        task: JoinHandle<()>,
    },
    Disarmed,
}

/// Armed/Disarmed watcher. Disarmed is terminal.
pub struct FileWatcher {
    state: Mutex<WatchState>,
}

impl Default for FileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WatchState::Idle),
        }
    }

    /// Start watching `path`. Returns whether the watcher is now armed.
    ///
    /// Only an idle watcher can be armed. Failures are logged, not raised.
    pub fn arm(&self, path: &Path, gate: Arc<WriteGate>, target: Arc<dyn Reconcile>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, WatchState::Idle) {
            debug!("Watcher already armed or disarmed; not arming");
            return false;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!("No tokio runtime; settings file watcher not started");
            return false;
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let file_name = path.file_name().map(|name| name.to_os_string());
        let mut watcher = match notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let touches_target = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if touches_target && tx.try_send(()).is_err() {
                        debug!("Watch event dropped; channel full or closed");
                    }
                }
                Err(err) => warn!("Watcher error: {:?}", err),
            },
        ) {
            Ok(watcher) => watcher,
            Err(err) => {
                error!("Failed to initialize watcher: {:?}", err);
                return false;
            }
        };

        // Watch the directory so atomic rename-over writes are seen too.
        let dir = watch_dir(path);
        if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            error!("Failed to watch path {}: {:?}", dir.display(), err);
            return false;
        }

        let task = handle.spawn(debounce_events(
            rx,
            gate,
            target,
            WATCH_DEBOUNCE,
            OWN_WRITE_QUIESCENCE,
        ));
        info!("Watching settings document {}", path.display());
        *state = WatchState::Armed {
            _watcher: watcher,
            task,
        };
        true
    }

    /// Stop watching. Returns `true` only if an armed watcher was torn down.
    pub fn disable(&self) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, WatchState::Disarmed) {
            WatchState::Armed { task, .. } => {
                task.abort();
                info!("Settings file watcher disabled");
                true
            }
            WatchState::Idle | WatchState::Disarmed => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(*self.state.lock(), WatchState::Armed { .. })
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Debounce loop. Every qualifying event restarts the timer; reconciliation
/// runs once the timer expires. Ends when the event channel closes.
pub(crate) async fn debounce_events(
    mut rx: mpsc::Receiver<()>,
    gate: Arc<WriteGate>,
    target: Arc<dyn Reconcile>,
    debounce: Duration,
    quiescence: Duration,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            incoming = rx.recv() => {
                match incoming {
                    Some(()) => {
                        if gate.suppresses_external_events(quiescence) {
                            debug!("Ignoring settings file event caused by own write");
                            continue;
                        }
                        deadline = Some(Instant::now() + debounce);
                    }
                    None => break,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                if gate.is_in_flight() {
                    debug!("Write in flight; skipping reconciliation");
                    continue;
                }
                debug!("Settings file changed externally; reconciling");
                target.reconcile().await;
            }
        }
    }
}
