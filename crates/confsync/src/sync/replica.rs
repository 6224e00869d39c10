//! Replica: a synchronized view of the owner's settings.
//!
//! Reads are served from a local copy. Every push from the owner replaces
//! that copy wholesale; mutations are forwarded to the owner and come back
//! as pushes.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use confsync_protocol::{
    SettingsMap, SyncPush, SyncRequest, SyncResponse, ValidationResult, WriteOutcome,
};

use super::link::OwnerLink;
use crate::config::ReplicaOptions;
use crate::error::{StoreError, StoreResult};
use crate::store::check_key;

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug)]
struct LocalCopy {
    settings: SettingsMap,
    defaults: SettingsMap,
    /// Owner revision `settings` reflects.
    revision: u64,
}

struct ReplicaShared {
    options: ReplicaOptions,
    copy: RwLock<Option<LocalCopy>>,
    /// Newest push seen before the snapshot was installed.
    early: Mutex<Option<(u64, SettingsMap)>>,
    /// Push stream when no runtime was available to drain it; reads poll it.
    undrained: Mutex<Option<mpsc::UnboundedReceiver<SyncPush>>>,
    events_tx: broadcast::Sender<SettingsMap>,
}

impl ReplicaShared {
    fn apply_push(&self, push: SyncPush) {
        let SyncPush::SettingsUpdated { settings, revision } = push;
        {
            let mut copy = self.copy.write();
            let Some(copy) = copy.as_mut() else {
                let mut early = self.early.lock();
                if early.as_ref().is_none_or(|(seen, _)| revision > *seen) {
                    *early = Some((revision, settings));
                }
                debug!("Held owner push {} until the snapshot arrives", revision);
                return;
            };
            if revision <= copy.revision {
                debug!(
                    "Ignoring owner push {} older than revision {}",
                    revision, copy.revision
                );
                return;
            }
            copy.settings = settings.clone();
            copy.revision = revision;
        }
        debug!("Replica settings replaced by owner push {}", revision);
        self.notify(settings);
    }

    /// Install the bulk snapshot. A push already seen with a higher
    /// revision wins over it.
    fn install(&self, settings: SettingsMap, defaults: SettingsMap, revision: u64) {
        let announce = {
            let mut copy = self.copy.write();
            // Only a held push has not been announced yet.
            let held = self.early.lock().take().map(|(seen, map)| (seen, map, true));
            let current = copy.take().map(|c| (c.revision, c.settings, false));
            let newer = [held, current]
                .into_iter()
                .flatten()
                .filter(|(seen, _, _)| *seen > revision)
                .max_by_key(|(seen, _, _)| *seen);
            let (revision, settings, unannounced) =
                newer.unwrap_or((revision, settings, false));
            info!(
                "Replica initialized with {} settings at revision {}",
                settings.len(),
                revision
            );
            let announce = unannounced.then(|| settings.clone());
            *copy = Some(LocalCopy {
                settings,
                defaults,
                revision,
            });
            announce
        };
        if let Some(settings) = announce {
            self.notify(settings);
        }
    }

    fn notify(&self, settings: SettingsMap) {
        if self.options.emit_event_on_updated {
            let _ = self.events_tx.send(settings);
        }
    }

    fn drain_pending(&self) {
        let mut undrained = self.undrained.lock();
        if let Some(rx) = undrained.as_mut() {
            while let Ok(push) = rx.try_recv() {
                self.apply_push(push);
            }
        }
    }
}

/// Replica handle. Cheap to clone.
#[derive(Clone)]
pub struct SettingsReplica {
    link: Arc<dyn OwnerLink>,
    shared: Arc<ReplicaShared>,
    listener: Arc<ListenerGuard>,
}

impl SettingsReplica {
    pub fn new(link: Arc<dyn OwnerLink>, options: ReplicaOptions) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            link,
            shared: Arc::new(ReplicaShared {
                options,
                copy: RwLock::new(None),
                early: Mutex::new(None),
                undrained: Mutex::new(None),
                events_tx,
            }),
            listener: Arc::new(ListenerGuard::default()),
        }
    }

    pub fn options(&self) -> ReplicaOptions {
        self.shared.options
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.copy.read().is_some()
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Register with the owner and fetch its settings and defaults.
    pub async fn init(&self) -> StoreResult<()> {
        self.start_listening();
        expect_registered(self.link.request(SyncRequest::RegisterListener).await?)?;
        let snapshot = self.link.request(SyncRequest::GetAllAndDefaults).await?;
        self.install_snapshot(snapshot)
    }

    /// Blocking form of [`SettingsReplica::init`]. Must not be called from
    /// async code.
    pub fn init_sync(&self) -> StoreResult<()> {
        self.start_listening();
        expect_registered(self.link.request_blocking(SyncRequest::RegisterListener)?)?;
        let snapshot = self
            .link
            .request_blocking(SyncRequest::GetAllAndDefaultsSync)?;
        self.install_snapshot(snapshot)
    }

    /// Start consuming pushes: on a task when a runtime is available, else
    /// lazily on every read.
    fn start_listening(&self) {
        let Some(mut rx) = self.link.take_pushes() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                let task = handle.spawn(async move {
                    while let Some(push) = rx.recv().await {
                        shared.apply_push(push);
                    }
                    debug!("Owner push stream ended");
                });
                *self.listener.0.lock() = Some(task);
            }
            Err(_) => {
                debug!("No runtime; replica pushes are applied on read");
                *self.shared.undrained.lock() = Some(rx);
            }
        }
    }

    fn install_snapshot(&self, response: SyncResponse) -> StoreResult<()> {
        let SyncResponse::Snapshot {
            settings,
            defaults,
            revision,
        } = response
        else {
            return Err(StoreError::UnexpectedResponse("get_all_and_defaults"));
        };
        self.shared.install(settings, defaults, revision);
        Ok(())
    }

    // ========================================================================
    // Local reads
    // ========================================================================

    fn read<R>(&self, f: impl FnOnce(&LocalCopy) -> R) -> StoreResult<R> {
        self.shared.drain_pending();
        let copy = self.shared.copy.read();
        let copy = copy.as_ref().ok_or(StoreError::Uninitialized)?;
        Ok(f(copy))
    }

    /// Local value, else the owner's default, else `None`.
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        check_key(key)?;
        self.read(|copy| {
            copy.settings
                .get(key)
                .or_else(|| copy.defaults.get(key))
                .cloned()
        })
    }

    pub fn has(&self, key: &str) -> StoreResult<bool> {
        check_key(key)?;
        self.read(|copy| copy.settings.contains_key(key))
    }

    pub fn get_all(&self) -> StoreResult<SettingsMap> {
        self.read(|copy| copy.settings.clone())
    }

    pub fn get_default(&self, key: &str) -> StoreResult<Option<Value>> {
        self.read(|copy| copy.defaults.get(key).cloned())
    }

    pub fn get_defaults(&self) -> StoreResult<SettingsMap> {
        self.read(|copy| copy.defaults.clone())
    }

    /// Subscribe to "updated" notifications. Nothing is sent when
    /// `emit_event_on_updated` is off.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsMap> {
        self.shared.events_tx.subscribe()
    }

    // ========================================================================
    // Owner requests
    // ========================================================================

    pub async fn validate(&self, key: &str, value: Value) -> StoreResult<ValidationResult> {
        check_key(key)?;
        let request = SyncRequest::Validate {
            key: key.to_string(),
            value,
        };
        match self.link.request(request).await? {
            SyncResponse::Validation { result } => Ok(result),
            _ => Err(StoreError::UnexpectedResponse("validate")),
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> StoreResult<ValidationResult> {
        check_key(key)?;
        let request = SyncRequest::Set {
            key: key.to_string(),
            value,
        };
        match self.link.request(request).await? {
            SyncResponse::Validation { result } => Ok(result),
            _ => Err(StoreError::UnexpectedResponse("set")),
        }
    }

    pub async fn set_all(&self, values: SettingsMap) -> StoreResult<BTreeMap<String, ValidationResult>> {
        match self.link.request(SyncRequest::SetAll { values }).await? {
            SyncResponse::SetAllResult { results } => Ok(results),
            _ => Err(StoreError::UnexpectedResponse("set_all")),
        }
    }

    pub async fn set_and_write(
        &self,
        key: &str,
        value: Value,
    ) -> StoreResult<(ValidationResult, WriteOutcome)> {
        check_key(key)?;
        let request = SyncRequest::SetAndWrite {
            key: key.to_string(),
            value,
        };
        match self.link.request(request).await? {
            SyncResponse::SetAndWritten { validation, write } => Ok((validation, write)),
            _ => Err(StoreError::UnexpectedResponse("set_and_write")),
        }
    }

    /// Like [`SettingsReplica::set_and_write`], with a blocking write on the
    /// owner.
    pub async fn set_and_write_sync(
        &self,
        key: &str,
        value: Value,
    ) -> StoreResult<(ValidationResult, WriteOutcome)> {
        check_key(key)?;
        let request = SyncRequest::SetAndWriteSync {
            key: key.to_string(),
            value,
        };
        match self.link.request(request).await? {
            SyncResponse::SetAndWritten { validation, write } => Ok((validation, write)),
            _ => Err(StoreError::UnexpectedResponse("set_and_write_sync")),
        }
    }

    pub async fn unset(&self, key: &str) -> StoreResult<bool> {
        check_key(key)?;
        let request = SyncRequest::Unset {
            key: key.to_string(),
        };
        match self.link.request(request).await? {
            SyncResponse::Unset { existed } => Ok(existed),
            _ => Err(StoreError::UnexpectedResponse("unset")),
        }
    }

    pub async fn reset(&self) -> StoreResult<bool> {
        match self.link.request(SyncRequest::Reset).await? {
            SyncResponse::Reset { changed } => Ok(changed),
            _ => Err(StoreError::UnexpectedResponse("reset")),
        }
    }

    pub async fn reset_and_write(&self) -> StoreResult<(bool, WriteOutcome)> {
        self.reset_and_write_with(SyncRequest::ResetAndWrite).await
    }

    pub async fn reset_and_write_sync(&self) -> StoreResult<(bool, WriteOutcome)> {
        self.reset_and_write_with(SyncRequest::ResetAndWriteSync).await
    }

    async fn reset_and_write_with(&self, request: SyncRequest) -> StoreResult<(bool, WriteOutcome)> {
        let name = request.name();
        match self.link.request(request).await? {
            SyncResponse::ResetAndWritten { changed, write } => Ok((changed, write)),
            _ => Err(StoreError::UnexpectedResponse(name)),
        }
    }

    pub async fn write(&self) -> StoreResult<WriteOutcome> {
        self.write_with(SyncRequest::Write).await
    }

    pub async fn write_sync(&self) -> StoreResult<WriteOutcome> {
        self.write_with(SyncRequest::WriteSync).await
    }

    async fn write_with(&self, request: SyncRequest) -> StoreResult<WriteOutcome> {
        let name = request.name();
        match self.link.request(request).await? {
            SyncResponse::Written { outcome } => Ok(outcome),
            _ => Err(StoreError::UnexpectedResponse(name)),
        }
    }

    /// The owner's current settings, fetched rather than read locally.
    pub async fn fetch_all(&self) -> StoreResult<SettingsMap> {
        self.fetch(SyncRequest::GetAll).await
    }

    pub async fn fetch_defaults(&self) -> StoreResult<SettingsMap> {
        self.fetch(SyncRequest::GetDefaults).await
    }

    async fn fetch(&self, request: SyncRequest) -> StoreResult<SettingsMap> {
        let name = request.name();
        match self.link.request(request).await? {
            SyncResponse::Settings { settings } => Ok(settings),
            _ => Err(StoreError::UnexpectedResponse(name)),
        }
    }

    /// Ask the owner to stop its file watcher.
    pub async fn disable_file_watcher(&self) -> StoreResult<bool> {
        match self.link.request(SyncRequest::DisableWatcher).await? {
            SyncResponse::WatcherDisabled { was_active } => Ok(was_active),
            _ => Err(StoreError::UnexpectedResponse("disable_watcher")),
        }
    }
}

/// Stops the push listener when the last replica handle goes away.
#[derive(Default)]
struct ListenerGuard(Mutex<Option<JoinHandle<()>>>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.lock().take() {
            task.abort();
        }
    }
}

fn expect_registered(response: SyncResponse) -> StoreResult<u64> {
    match response {
        SyncResponse::Registered { listener_id } => Ok(listener_id),
        _ => Err(StoreError::UnexpectedResponse("register_listener")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreOptions;
    use crate::persistence::MemoryDocument;
    use crate::store::SettingsStore;
    use crate::sync::{LocalLink, SyncHost};
    use serde_json::json;

    fn owner() -> SettingsStore {
        let store = SettingsStore::with_backend(
            &json!({
                "size": { "type": "number", "default": 25, "min": 10, "max": 40 },
                "dark": { "type": "boolean", "default": false }
            }),
            StoreOptions::default(),
            Arc::new(MemoryDocument::new()),
        )
        .unwrap();
        store.init_sync().unwrap();
        store
    }

    fn replica(owner: &SettingsStore, options: ReplicaOptions) -> SettingsReplica {
        let link = Arc::new(LocalLink::new(SyncHost::new(owner.clone())));
        SettingsReplica::new(link, options)
    }

    /// Changes the owner's settings after the snapshot is built and before
    /// it reaches the replica.
    struct RacingLink {
        inner: LocalLink,
        owner: SettingsStore,
    }

    #[async_trait::async_trait]
    impl OwnerLink for RacingLink {
        async fn request(&self, request: SyncRequest) -> StoreResult<SyncResponse> {
            let snapshot = matches!(request, SyncRequest::GetAllAndDefaults);
            let response = self.inner.request(request).await?;
            if snapshot {
                self.owner.set("size", json!(33)).unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Ok(response)
        }

        fn request_blocking(&self, request: SyncRequest) -> StoreResult<SyncResponse> {
            self.inner.request_blocking(request)
        }

        fn take_pushes(&self) -> Option<mpsc::UnboundedReceiver<SyncPush>> {
            self.inner.take_pushes()
        }
    }

    fn updated(size: i64, revision: u64) -> SyncPush {
        let mut settings = SettingsMap::new();
        settings.insert("size".to_string(), json!(size));
        SyncPush::SettingsUpdated { settings, revision }
    }

    #[test]
    fn test_reads_before_init() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        assert!(matches!(replica.get("size"), Err(StoreError::Uninitialized)));
    }

    #[test]
    fn test_push_before_snapshot_is_held() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        let mut events = replica.subscribe();

        replica.shared.apply_push(updated(33, 3));
        replica.shared.apply_push(updated(31, 2));
        assert!(!replica.is_initialized());
        assert!(matches!(replica.get_all(), Err(StoreError::Uninitialized)));

        let mut defaults = SettingsMap::new();
        defaults.insert("size".to_string(), json!(25));
        replica.shared.install(defaults.clone(), defaults, 2);

        assert_eq!(replica.get("size").unwrap(), Some(json!(33)));
        assert_eq!(events.try_recv().unwrap()["size"], json!(33));

        replica.shared.apply_push(updated(12, 3));
        assert_eq!(replica.get("size").unwrap(), Some(json!(33)));
        replica.shared.apply_push(updated(14, 4));
        assert_eq!(replica.get("size").unwrap(), Some(json!(14)));
    }

    #[test]
    fn test_held_push_older_than_snapshot_is_dropped() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        let mut events = replica.subscribe();

        replica.shared.apply_push(updated(12, 1));
        let mut settings = SettingsMap::new();
        settings.insert("size".to_string(), json!(20));
        replica.shared.install(settings, SettingsMap::new(), 2);

        assert_eq!(replica.get("size").unwrap(), Some(json!(20)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_change_during_snapshot_fetch_is_kept() {
        let owner = owner();
        let link = Arc::new(RacingLink {
            inner: LocalLink::new(SyncHost::new(owner.clone())),
            owner: owner.clone(),
        });
        let replica = SettingsReplica::new(link, ReplicaOptions::default());
        replica.init().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(owner.get("size").unwrap(), Some(json!(33)));
        assert_eq!(replica.get("size").unwrap(), owner.get("size").unwrap());
    }

    #[test]
    fn test_init_sync_without_runtime_drains_on_read() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        replica.init_sync().unwrap();
        assert_eq!(replica.get("size").unwrap(), Some(json!(25)));

        owner.set("size", json!(33)).unwrap();
        assert_eq!(replica.get("size").unwrap(), Some(json!(33)));
        assert_eq!(replica.get_all().unwrap(), owner.get_all().unwrap());
    }

    #[test]
    fn test_get_falls_back_to_owner_defaults() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        replica.init_sync().unwrap();

        owner.unset("dark").unwrap();
        assert!(!replica.has("dark").unwrap());
        assert_eq!(replica.get("dark").unwrap(), Some(json!(false)));
        assert_eq!(replica.get("missing").unwrap(), None);
        assert_eq!(replica.get_default("size").unwrap(), Some(json!(25)));
    }

    #[tokio::test]
    async fn test_replica_set_propagates() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        replica.init().await.unwrap();
        let mut events = replica.subscribe();

        let result = replica.set("size", json!(12)).await.unwrap();
        assert!(result.status);
        assert_eq!(owner.get("size").unwrap(), Some(json!(12)));

        let updated = events.recv().await.unwrap();
        assert_eq!(updated["size"], json!(12));
        assert_eq!(replica.get("size").unwrap(), Some(json!(12)));
    }

    #[tokio::test]
    async fn test_pushes_arrive_in_mutation_order() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        replica.init().await.unwrap();
        let mut events = replica.subscribe();

        for size in [11, 12, 13, 14] {
            owner.set("size", json!(size)).unwrap();
        }
        for size in [11, 12, 13, 14] {
            assert_eq!(events.recv().await.unwrap()["size"], json!(size));
        }
    }

    #[tokio::test]
    async fn test_events_suppressed_when_disabled() {
        let owner = owner();
        let replica = replica(
            &owner,
            ReplicaOptions {
                emit_event_on_updated: false,
            },
        );
        replica.init().await.unwrap();
        let mut events = replica.subscribe();

        replica.set("dark", json!(true)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(events.try_recv().is_err());
        assert_eq!(replica.get("dark").unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_owner_requests() {
        let owner = owner();
        let replica = replica(&owner, ReplicaOptions::default());
        replica.init().await.unwrap();

        let invalid = replica.validate("size", json!(55)).await.unwrap();
        assert!(!invalid.status);

        let (result, outcome) = replica.set_and_write("size", json!(20)).await.unwrap();
        assert!(result.status);
        assert_eq!(outcome, WriteOutcome::Written);

        assert!(replica.unset("size").await.unwrap());
        assert!(replica.reset().await.unwrap());
        assert_eq!(replica.fetch_all().await.unwrap(), replica.fetch_defaults().await.unwrap());
        assert!(!replica.disable_file_watcher().await.unwrap());

        let err = replica.set("", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
