//! Schema-validated settings store shared between cooperating processes.
//!
//! One process owns the settings document and is its only writer
//! ([`SettingsStore`]); other processes hold a synchronized copy
//! ([`SettingsReplica`]) and forward mutations to the owner.
//!
//! ```no_run
//! use confsync::{SettingsStore, StoreOptions};
//! use serde_json::json;
//!
//! # async fn run() -> confsync::StoreResult<()> {
//! let schema = json!({
//!     "size": { "type": "number", "default": 25, "min": 10, "max": 40 }
//! });
//! let store = SettingsStore::new(&schema, StoreOptions::default())?;
//! store.init().await?;
//! store.set("size", json!(30))?;
//! store.write().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod defaults;
pub mod error;
pub mod persistence;
pub mod schema;
pub mod store;
pub mod sync;
pub mod watcher;

pub use config::{ReplicaOptions, StoreOptions};
pub use error::{StoreError, StoreResult};
pub use persistence::{DocumentStore, FileDocument, MemoryDocument};
pub use schema::Schema;
pub use store::SettingsStore;
pub use sync::{
    ChangeHub, LocalLink, OwnerLink, SettingsReplica, SocketLink, SocketServer, SyncHost,
};
pub use watcher::{OWN_WRITE_QUIESCENCE, WATCH_DEBOUNCE};

pub use confsync_protocol::{
    SettingsMap, SyncPush, SyncRequest, SyncResponse, ValidationErrors, ValidationResult,
    WriteOutcome,
};
