//! Owner settings store.
//!
//! The owner is the only writer of the settings document. All cache reads
//! and writes go through one lock; every mutation that changes content
//! publishes the new snapshot through the [`ChangeHub`] before the lock is
//! released, so listeners see changes in mutation order.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use confsync_protocol::{SettingsMap, ValidationResult, WriteOutcome};

use crate::cache::SettingsCache;
use crate::config::StoreOptions;
use crate::defaults::DefaultTable;
use crate::error::{StoreError, StoreResult};
use crate::persistence::{DocumentStore, FileDocument, LoadOutcome, Persistence, interpret_document};
use crate::schema::{FieldError, Schema};
use crate::sync::ChangeHub;
use crate::watcher::{FileWatcher, Reconcile};

struct StoreShared {
    schema: Schema,
    defaults: DefaultTable,
    options: StoreOptions,
    persistence: Persistence,
    /// `None` until initialization completes.
    cache: Mutex<Option<SettingsCache>>,
    hub: ChangeHub,
    watcher: FileWatcher,
}

/// Handle to the owner store. Cheap to clone.
#[derive(Clone)]
pub struct SettingsStore {
    shared: Arc<StoreShared>,
}

impl SettingsStore {
    /// Create a store backed by the file named in `options`.
    pub fn new(schema: &Value, options: StoreOptions) -> StoreResult<Self> {
        let options = options.validated()?;
        let backend = Arc::new(FileDocument::new(options.complete_file_path()));
        Self::with_backend(schema, options, backend)
    }

    /// Create a store on a custom document backend.
    pub fn with_backend(
        schema: &Value,
        options: StoreOptions,
        backend: Arc<dyn DocumentStore>,
    ) -> StoreResult<Self> {
        let options = options.validated()?;
        let schema = Schema::compile(schema)?;
        let defaults = DefaultTable::from_schema(&schema);
        let persistence = Persistence::new(backend, options.pretty_print);

        debug!(
            "Compiled settings schema with {} fields for {}",
            schema.len(),
            persistence.backend().location().display()
        );

        Ok(Self {
            shared: Arc::new(StoreShared {
                schema,
                defaults,
                options,
                persistence,
                cache: Mutex::new(None),
                hub: ChangeHub::new(),
                watcher: FileWatcher::new(),
            }),
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.shared.options
    }

    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// The hub replicas register with.
    pub fn hub(&self) -> &ChangeHub {
        &self.shared.hub
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.cache.lock().is_some()
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Load the settings document (blocking), repairing or bootstrapping it
    /// as needed, then arm the watcher if configured.
    ///
    /// The watcher's debounce loop runs on the tokio runtime, so with
    /// `watch_file` set on a file-backed store this fails with
    /// [`StoreError::NoRuntime`] when called outside one.
    pub fn init_sync(&self) -> StoreResult<()> {
        if self.wants_watcher() && tokio::runtime::Handle::try_current().is_err() {
            return Err(StoreError::NoRuntime);
        }
        if self.shared.options.mkdir_on_startup {
            self.shared.persistence.prepare()?;
        }
        let document = self.shared.persistence.read();
        let (settings, needs_write) = self.settle_loaded(document)?;
        self.install(settings);

        if needs_write {
            let outcome = self.write_sync()?;
            if let Some(reason) = outcome.failure() {
                warn!("Could not persist initial settings: {}", reason);
            }
        }
        self.arm_watcher();
        info!(
            "Settings initialized from {}",
            self.complete_file_path().display()
        );
        Ok(())
    }

    /// Async form of [`SettingsStore::init_sync`].
    pub async fn init(&self) -> StoreResult<()> {
        if self.shared.options.mkdir_on_startup {
            let persistence = self.shared.persistence.clone();
            tokio::task::spawn_blocking(move || persistence.prepare())
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        }
        let document = self.shared.persistence.read_async().await;
        let (settings, needs_write) = self.settle_loaded(document)?;
        self.install(settings);

        if needs_write {
            let outcome = self.write().await?;
            if let Some(reason) = outcome.failure() {
                warn!("Could not persist initial settings: {}", reason);
            }
        }
        self.arm_watcher();
        info!(
            "Settings initialized from {}",
            self.complete_file_path().display()
        );
        Ok(())
    }

    /// Decide what a freshly read document means for the cache. Returns the
    /// settings to install and whether they must be written back.
    fn settle_loaded(&self, document: Option<SettingsMap>) -> StoreResult<(SettingsMap, bool)> {
        let shared = &self.shared;
        match interpret_document(
            document,
            &shared.schema,
            &shared.defaults,
            shared.options.validate_file,
        ) {
            LoadOutcome::Absent => {
                info!("No usable settings document; writing defaults");
                Ok((shared.defaults.to_map(), true))
            }
            LoadOutcome::Valid(settings) => Ok((settings, false)),
            LoadOutcome::Invalid { repaired, errors } => {
                if shared.options.default_on_fail_validation {
                    warn!(
                        "Settings document had {} invalid field(s); restored defaults: {}",
                        errors.len(),
                        join_messages(&errors)
                    );
                    Ok((repaired, true))
                } else {
                    Err(StoreError::InvalidDocument(messages(errors)))
                }
            }
        }
    }

    /// Replace the cache wholesale, publishing if it changed.
    fn install(&self, settings: SettingsMap) {
        let mut guard = self.shared.cache.lock();
        match guard.as_mut() {
            Some(cache) => {
                if cache.replace_all(settings) {
                    self.shared.hub.publish(cache.as_map());
                }
            }
            None => *guard = Some(SettingsCache::from_map(settings)),
        }
    }

    fn wants_watcher(&self) -> bool {
        self.shared.options.watch_file && self.shared.persistence.backend().watch_path().is_some()
    }

    fn arm_watcher(&self) {
        if !self.shared.options.watch_file {
            return;
        }
        let Some(path) = self.shared.persistence.backend().watch_path() else {
            debug!("Document backend has no file to watch");
            return;
        };
        let target = Arc::new(Reconciler {
            shared: Arc::downgrade(&self.shared),
        });
        self.shared
            .watcher
            .arm(path, self.shared.persistence.gate().clone(), target);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn read<R>(&self, f: impl FnOnce(&SettingsCache) -> R) -> StoreResult<R> {
        let guard = self.shared.cache.lock();
        let cache = guard.as_ref().ok_or(StoreError::Uninitialized)?;
        Ok(f(cache))
    }

    /// Cached value, else the schema default, else `None`.
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        check_key(key)?;
        self.read(|cache| {
            cache
                .get(key)
                .or_else(|| self.shared.defaults.get(key))
                .cloned()
        })
    }

    /// Whether `key` is in the cache. Defaults are not consulted.
    pub fn has(&self, key: &str) -> StoreResult<bool> {
        check_key(key)?;
        self.read(|cache| cache.contains(key))
    }

    pub fn get_all(&self) -> StoreResult<SettingsMap> {
        self.read(SettingsCache::snapshot)
    }

    /// Settings together with the change hub revision they correspond to.
    /// Publishing happens under the cache lock, so the pair is consistent.
    pub fn get_all_with_revision(&self) -> StoreResult<(SettingsMap, u64)> {
        self.read(|cache| (cache.snapshot(), self.shared.hub.revision()))
    }

    pub fn get_default(&self, key: &str) -> Option<Value> {
        self.shared.defaults.get(key).cloned()
    }

    pub fn get_defaults(&self) -> SettingsMap {
        self.shared.defaults.to_map()
    }

    /// Check `value` against the schema for `key` without storing it.
    pub fn validate(&self, key: &str, value: &Value) -> StoreResult<ValidationResult> {
        check_key(key)?;
        let default = self.get_default(key);
        Ok(match self.shared.schema.check_field(key, value) {
            Ok(()) => ValidationResult::valid(default),
            Err(errors) => ValidationResult::invalid(default, messages(errors)),
        })
    }

    pub fn complete_file_path(&self) -> PathBuf {
        self.shared.persistence.backend().location()
    }

    /// Subscribe to snapshots published after every content change.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsMap> {
        self.shared.hub.subscribe()
    }

    fn current_snapshot(&self) -> SettingsMap {
        self.shared
            .cache
            .lock()
            .as_ref()
            .map(SettingsCache::snapshot)
            .unwrap_or_default()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn mutate<R>(&self, f: impl FnOnce(&mut SettingsCache) -> (R, bool)) -> StoreResult<R> {
        let mut guard = self.shared.cache.lock();
        let cache = guard.as_mut().ok_or(StoreError::Uninitialized)?;
        let (result, changed) = f(cache);
        if changed {
            self.shared.hub.publish(cache.as_map());
        }
        Ok(result)
    }

    /// Validate and store one value. Returns the result and whether the
    /// cache changed.
    fn apply_set(&self, cache: &mut SettingsCache, key: &str, value: Value) -> (ValidationResult, bool) {
        let shared = &self.shared;
        let default = shared.defaults.get(key).cloned();

        if shared.options.validate
            && let Err(errors) = shared.schema.check_field(key, &value)
        {
            if shared.options.default_on_fail_validation {
                debug!("Invalid value for '{}'; applying default", key);
                let changed = default
                    .clone()
                    .is_some_and(|fallback| cache.put(key, fallback));
                return (ValidationResult::default_applied(default), changed);
            }
            return (ValidationResult::invalid(default, messages(errors)), false);
        }

        let changed = cache.put(key, value);
        (ValidationResult::valid(default), changed)
    }

    pub fn set(&self, key: &str, value: Value) -> StoreResult<ValidationResult> {
        check_key(key)?;
        self.mutate(|cache| self.apply_set(cache, key, value))
    }

    /// Set several keys, publishing at most once.
    pub fn set_all(&self, values: SettingsMap) -> StoreResult<BTreeMap<String, ValidationResult>> {
        for key in values.keys() {
            check_key(key)?;
        }
        self.mutate(|cache| {
            let mut any_changed = false;
            let mut results = BTreeMap::new();
            for (key, value) in values {
                let (result, changed) = self.apply_set(cache, &key, value);
                any_changed |= changed;
                results.insert(key, result);
            }
            (results, any_changed)
        })
    }

    /// Remove `key` from the cache. Returns whether it was present.
    pub fn unset(&self, key: &str) -> StoreResult<bool> {
        check_key(key)?;
        self.mutate(|cache| {
            let existed = cache.remove(key);
            (existed, existed)
        })
    }

    /// Replace the cache with the default table. Returns whether it changed.
    pub fn reset(&self) -> StoreResult<bool> {
        let defaults = self.shared.defaults.to_map();
        self.mutate(|cache| {
            let changed = cache.replace_all(defaults);
            (changed, changed)
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Persist the current settings, coalescing with any write in flight.
    ///
    /// The write runs on its own task and completes even if the caller stops
    /// waiting.
    pub async fn write(&self) -> StoreResult<WriteOutcome> {
        if !self.is_initialized() {
            return Err(StoreError::Uninitialized);
        }
        let store = self.clone();
        let task = tokio::spawn(async move {
            store
                .shared
                .persistence
                .save(|| store.current_snapshot())
                .await
        });
        Ok(task
            .await
            .unwrap_or_else(|e| WriteOutcome::Failed(format!("write task failed: {e}"))))
    }

    /// Blocking form of [`SettingsStore::write`].
    pub fn write_sync(&self) -> StoreResult<WriteOutcome> {
        if !self.is_initialized() {
            return Err(StoreError::Uninitialized);
        }
        Ok(self
            .shared
            .persistence
            .save_blocking(|| self.current_snapshot()))
    }

    pub async fn set_and_write(
        &self,
        key: &str,
        value: Value,
    ) -> StoreResult<(ValidationResult, WriteOutcome)> {
        let result = self.set(key, value)?;
        let outcome = self.write().await?;
        Ok((result, outcome))
    }

    pub fn set_and_write_sync(
        &self,
        key: &str,
        value: Value,
    ) -> StoreResult<(ValidationResult, WriteOutcome)> {
        let result = self.set(key, value)?;
        let outcome = self.write_sync()?;
        Ok((result, outcome))
    }

    pub async fn reset_and_write(&self) -> StoreResult<(bool, WriteOutcome)> {
        let changed = self.reset()?;
        let outcome = self.write().await?;
        Ok((changed, outcome))
    }

    pub fn reset_and_write_sync(&self) -> StoreResult<(bool, WriteOutcome)> {
        let changed = self.reset()?;
        let outcome = self.write_sync()?;
        Ok((changed, outcome))
    }

    // ========================================================================
    // Watcher and shutdown
    // ========================================================================

    /// Stop reacting to external file changes. Returns whether an armed
    /// watcher was torn down.
    pub fn disable_file_watcher(&self) -> bool {
        self.shared.watcher.disable()
    }

    pub fn is_watching(&self) -> bool {
        self.shared.watcher.is_armed()
    }

    /// Prepare to quit: stop watching, let any in-flight write finish, and
    /// write once more if `write_before_quit` is set.
    pub async fn shutdown(&self) -> Option<WriteOutcome> {
        self.disable_file_watcher();
        let gate = self.shared.persistence.gate().clone();
        gate.wait_idle().await;

        if !self.shared.options.write_before_quit || !self.is_initialized() {
            return None;
        }
        let outcome = match self.write().await {
            Ok(outcome) => outcome,
            Err(e) => WriteOutcome::Failed(e.to_string()),
        };
        // A coalesced write completes on the in-flight task.
        gate.wait_idle().await;
        info!("Settings flushed before quit: {:?}", outcome);
        Some(outcome)
    }

    /// Re-read the document after an external change.
    async fn reconcile_from_disk(&self) {
        let shared = &self.shared;
        let Some(document) = shared.persistence.read_async().await else {
            warn!("Settings document unusable after external change; keeping current settings");
            return;
        };

        match interpret_document(
            Some(document),
            &shared.schema,
            &shared.defaults,
            shared.options.validate_file,
        ) {
            LoadOutcome::Absent => {}
            LoadOutcome::Valid(settings) => {
                info!("Reloaded settings after external change");
                self.install(settings);
            }
            LoadOutcome::Invalid { repaired, errors } => {
                if !shared.options.default_on_fail_validation {
                    error!(
                        "Externally modified settings failed validation; ignoring: {}",
                        join_messages(&errors)
                    );
                    return;
                }
                warn!(
                    "Externally modified settings had invalid fields; restored defaults: {}",
                    join_messages(&errors)
                );
                self.install(repaired);
                match self.write().await {
                    Ok(WriteOutcome::Failed(reason)) => {
                        warn!("Could not persist repaired settings: {}", reason)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Could not persist repaired settings: {}", e),
                }
            }
        }
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("path", &self.complete_file_path())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Watcher target. Holds the store weakly so an armed watcher does not keep
/// a dropped store alive.
struct Reconciler {
    shared: Weak<StoreShared>,
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        SettingsStore { shared }.reconcile_from_disk().await;
    }
}

pub(crate) fn check_key(key: &str) -> StoreResult<()> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn messages(errors: Vec<FieldError>) -> Vec<String> {
    errors.into_iter().map(|e| e.message).collect()
}

fn join_messages(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
