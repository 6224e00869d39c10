//! Persistence engine: document backends, load interpretation and
//! write-coalescing saves.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use confsync_protocol::{SettingsMap, WriteOutcome};

use crate::defaults::DefaultTable;
use crate::error::{StoreError, StoreResult};
use crate::schema::{FieldError, Schema};

/// Backend holding the raw settings document.
///
/// Methods block; async callers go through [`Persistence`], which moves them
/// onto the blocking pool.
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Read the raw document. `Ok(None)` when it does not exist.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the document with `bytes`.
    fn store(&self, bytes: &[u8]) -> io::Result<()>;

    /// Create whatever must exist before the first read or write.
    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }

    /// File to watch for external modification, if the backend has one.
    fn watch_path(&self) -> Option<&Path> {
        None
    }

    /// Human-readable location for logs and errors.
    fn location(&self) -> PathBuf;
}

// ============================================================================
// File backend
// ============================================================================

/// Settings document on the local filesystem.
///
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so readers never observe a half-written document.
#[derive(Debug, Clone)]
pub struct FileDocument {
    path: PathBuf,
}

impl FileDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl DocumentStore for FileDocument {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, bytes: &[u8]) -> io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.parent_dir())?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }

    fn prepare(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.parent_dir())
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

// ============================================================================
// Memory backend
// ============================================================================

/// In-memory document. Counts physical writes and can simulate slow or
/// failing storage.
#[derive(Debug, Default)]
pub struct MemoryDocument {
    data: Mutex<Option<Vec<u8>>>,
    writes: AtomicUsize,
    latency: Mutex<Duration>,
    fail_writes: AtomicBool,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing document.
    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        let doc = Self::default();
        *doc.data.lock() = Some(bytes.into());
        doc
    }

    /// Replace the document as an outside editor would. Not counted as a
    /// write.
    pub fn set_contents(&self, bytes: impl Into<Vec<u8>>) {
        *self.data.lock() = Some(bytes.into());
    }

    /// Delay every write by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of physical writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current document parsed as JSON, if any.
    pub fn contents(&self) -> Option<Value> {
        self.data
            .lock()
            .as_ref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    pub fn raw(&self) -> Option<Vec<u8>> {
        self.data.lock().clone()
    }
}

impl DocumentStore for MemoryDocument {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().clone())
    }

    fn store(&self, bytes: &[u8]) -> io::Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated write failure"));
        }
        *self.data.lock() = Some(bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> PathBuf {
        PathBuf::from(":memory:")
    }
}

// ============================================================================
// Write gate
// ============================================================================

#[derive(Debug, Default)]
struct GateState {
    in_flight: bool,
    again: bool,
    last_write: Option<Instant>,
}

/// Pending-write state: at most one write in flight, at most one queued.
#[derive(Debug)]
pub struct WriteGate {
    state: Mutex<GateState>,
    busy_tx: watch::Sender<bool>,
}

impl Default for WriteGate {
    fn default() -> Self {
        let (busy_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(GateState::default()),
            busy_tx,
        }
    }
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate. If a write is already in flight, queue a follow-up
    /// write instead and return `false`.
    pub fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.in_flight {
            state.again = true;
            return false;
        }
        state.in_flight = true;
        self.busy_tx.send_replace(true);
        true
    }

    /// Record a finished physical write. Returns `true` when a follow-up was
    /// requested meanwhile; the gate then stays claimed for it.
    pub fn finish(&self) -> bool {
        let mut state = self.state.lock();
        state.last_write = Some(Instant::now());
        if state.again {
            state.again = false;
            return true;
        }
        state.in_flight = false;
        self.busy_tx.send_replace(false);
        false
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    pub fn last_write(&self) -> Option<Instant> {
        self.state.lock().last_write
    }

    /// Whether external change events should be ignored right now: a write
    /// is in flight, or the last own write finished less than `window` ago.
    pub fn suppresses_external_events(&self, window: Duration) -> bool {
        let state = self.state.lock();
        state.in_flight
            || state
                .last_write
                .is_some_and(|at| at.elapsed() < window)
    }

    /// Wait until no write is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.busy_tx.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }
}

// ============================================================================
// Load interpretation
// ============================================================================

/// What a loaded document means for the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Missing, unreadable or not a JSON object.
    Absent,
    /// Usable as-is.
    Valid(SettingsMap),
    /// Failed validation. `repaired` has every failing field reset to its
    /// default; valid and undeclared keys are kept.
    Invalid {
        repaired: SettingsMap,
        errors: Vec<FieldError>,
    },
}

/// Parse raw bytes into a settings map. Anything but a JSON object is
/// treated as no document.
pub fn parse_document(bytes: &[u8]) -> Option<SettingsMap> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Some(map.into_iter().collect()),
        Ok(other) => {
            warn!("Settings document is not a JSON object (found {})", type_name(&other));
            None
        }
        Err(e) => {
            warn!("Failed to parse settings document: {}", e);
            None
        }
    }
}

/// Apply the load protocol's validation step to a parsed document.
pub fn interpret_document(
    document: Option<SettingsMap>,
    schema: &Schema,
    defaults: &DefaultTable,
    validate_file: bool,
) -> LoadOutcome {
    let Some(document) = document else {
        return LoadOutcome::Absent;
    };
    if !validate_file {
        return LoadOutcome::Valid(document);
    }

    match schema.check(&document) {
        Ok(()) => LoadOutcome::Valid(document),
        Err(errors) => {
            let mut repaired = document;
            for error in &errors {
                if let Some(default) = defaults.get(&error.field) {
                    repaired.insert(error.field.clone(), default.clone());
                }
            }
            LoadOutcome::Invalid { repaired, errors }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Reads and writes the settings document through a [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct Persistence {
    backend: Arc<dyn DocumentStore>,
    pretty: bool,
    gate: Arc<WriteGate>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn DocumentStore>, pretty: bool) -> Self {
        Self {
            backend,
            pretty,
            gate: Arc::new(WriteGate::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.backend
    }

    pub fn gate(&self) -> &Arc<WriteGate> {
        &self.gate
    }

    /// Create the document's directory. Failure is fatal for the store.
    pub fn prepare(&self) -> StoreResult<()> {
        self.backend
            .prepare()
            .map_err(|source| StoreError::DirectoryCreation {
                path: self.backend.location(),
                source,
            })
    }

    /// Read and parse the document. Read and parse failures both mean
    /// "no document".
    pub fn read(&self) -> Option<SettingsMap> {
        match self.backend.load() {
            Ok(Some(bytes)) => parse_document(&bytes),
            Ok(None) => {
                info!("No settings document at {}", self.backend.location().display());
                None
            }
            Err(e) => {
                warn!(
                    "Failed to read settings document {}: {}",
                    self.backend.location().display(),
                    e
                );
                None
            }
        }
    }

    pub async fn read_async(&self) -> Option<SettingsMap> {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.read()).await {
            Ok(document) => document,
            Err(e) => {
                warn!("Settings read task failed: {}", e);
                None
            }
        }
    }

    /// Serialize a snapshot, pretty-printed with 4-space indentation if
    /// configured.
    pub fn serialize(&self, settings: &SettingsMap) -> serde_json::Result<Vec<u8>> {
        let mut buf = Vec::new();
        if self.pretty {
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
            settings.serialize(&mut ser)?;
        } else {
            serde_json::to_writer(&mut buf, settings)?;
        }
        Ok(buf)
    }

    /// One physical write, bypassing the gate.
    fn write_once(&self, settings: &SettingsMap) -> WriteOutcome {
        let bytes = match self.serialize(settings) {
            Ok(bytes) => bytes,
            Err(e) => return WriteOutcome::Failed(format!("serialization failed: {e}")),
        };
        match self.backend.store(&bytes) {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                warn!(
                    "Failed to write settings document {}: {}",
                    self.backend.location().display(),
                    e
                );
                WriteOutcome::Failed(e.to_string())
            }
        }
    }

    async fn write_once_async(&self, settings: SettingsMap) -> WriteOutcome {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.write_once(&settings)).await {
            Ok(outcome) => outcome,
            Err(e) => WriteOutcome::Failed(format!("write task failed: {e}")),
        }
    }

    /// Blocking coalesced save. `snapshot` is called for every physical
    /// write so a follow-up write sees the then-current settings.
    pub fn save_blocking(&self, snapshot: impl Fn() -> SettingsMap) -> WriteOutcome {
        if !self.gate.try_begin() {
            debug!("Write already in flight; coalescing");
            return WriteOutcome::Coalesced;
        }
        loop {
            let outcome = self.write_once(&snapshot());
            if !self.gate.finish() {
                return outcome;
            }
            debug!("Settings changed during write; writing again");
        }
    }

    /// Async coalesced save. See [`Persistence::save_blocking`].
    pub async fn save(&self, snapshot: impl Fn() -> SettingsMap) -> WriteOutcome {
        if !self.gate.try_begin() {
            debug!("Write already in flight; coalescing");
            return WriteOutcome::Coalesced;
        }
        loop {
            let outcome = self.write_once_async(snapshot()).await;
            if !self.gate.finish() {
                return outcome;
            }
            debug!("Settings changed during write; writing again");
        }
    }
}
