//! Change hub: fans settings snapshots out to replicas and local subscribers.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use confsync_protocol::{SettingsMap, SyncPush};

/// Size of the broadcast channel for in-process subscribers.
const EVENT_BUFFER_SIZE: usize = 256;

/// Sender side of a registered replica endpoint.
pub type PushSender = mpsc::UnboundedSender<SyncPush>;

/// Registry of replica endpoints plus a local broadcast channel.
///
/// `publish` is synchronous, so calling it while the cache lock is held
/// delivers snapshots in mutation order. Every publish bumps the revision
/// stamped on the pushes it sends.
pub struct ChangeHub {
    /// Listener ID -> push sender
    listeners: DashMap<u64, PushSender>,
    next_id: AtomicU64,
    revision: AtomicU64,
    local_tx: broadcast::Sender<SettingsMap>,
}

impl ChangeHub {
    pub fn new() -> Self {
        let (local_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            revision: AtomicU64::new(0),
            local_tx,
        }
    }

    /// Register a new replica endpoint and return its ID and push stream.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<SyncPush>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register_sender(tx), rx)
    }

    /// Register an existing push sender (stream transports own theirs).
    pub fn register_sender(&self, tx: PushSender) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, tx);
        info!("Registered settings listener {}", id);
        id
    }

    pub fn unregister(&self, id: u64) {
        if self.listeners.remove(&id).is_some() {
            info!("Unregistered settings listener {}", id);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Subscribe to snapshots in this process.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsMap> {
        self.local_tx.subscribe()
    }

    /// Revision of the most recent publish; 0 before the first.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Push `settings` to every listener and local subscriber.
    pub fn publish(&self, settings: &SettingsMap) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut closed = Vec::new();
        for entry in self.listeners.iter() {
            let push = SyncPush::SettingsUpdated {
                settings: settings.clone(),
                revision,
            };
            if entry.value().send(push).is_err() {
                closed.push(*entry.key());
            }
        }
        // Removal must wait until the iterator's shard guards are released.
        for id in closed {
            debug!("Dropping closed settings listener {}", id);
            self.listeners.remove(&id);
        }

        let _ = self.local_tx.send(settings.clone());
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}
