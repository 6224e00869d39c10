//! Test utilities and common setup.
#![allow(dead_code)]

use confsync::{MemoryDocument, SettingsStore, StoreOptions};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;

/// Schema used across the integration tests.
pub fn test_schema() -> Value {
    json!({
        "size": { "type": "number", "default": 25, "min": 10, "max": 40 },
        "dark": { "type": "boolean", "default": false },
        "theme": { "type": "enum", "default": "light", "values": ["light", "dark", "sepia"] },
        "email": { "type": "email", "default": "user@example.com", "optional": true },
        "nickname": { "type": "string", "default": "anon", "min": 2, "max": 16 }
    })
}

/// Options pointing at `dir`, watcher off.
pub fn options_in(dir: &Path) -> StoreOptions {
    StoreOptions::default().with_file_path(dir)
}

/// Initialized store backed by a real file in `dir`.
pub async fn file_store(dir: &Path) -> SettingsStore {
    let store = SettingsStore::new(&test_schema(), options_in(dir)).expect("valid store");
    store.init().await.expect("store init");
    store
}

/// Initialized store backed by memory, plus the backend for inspection.
pub fn memory_store(options: StoreOptions) -> (SettingsStore, Arc<MemoryDocument>) {
    let doc = Arc::new(MemoryDocument::new());
    let store =
        SettingsStore::with_backend(&test_schema(), options, doc.clone()).expect("valid store");
    store.init_sync().expect("store init");
    (store, doc)
}
