//! Owner store integration tests.

use confsync::{
    MemoryDocument, SettingsStore, StoreError, StoreOptions, ValidationResult, WriteOutcome,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{file_store, memory_store, options_in, test_schema};

/// Writing and re-reading through a fresh store reproduces the same content.
#[tokio::test]
async fn test_write_then_fresh_init_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path()).await;

    store.set("size", json!(33)).unwrap();
    store.set("theme", json!("sepia")).unwrap();
    store.set("window.width", json!(1280)).unwrap();
    assert_eq!(store.write().await.unwrap(), WriteOutcome::Written);
    let before = store.get_all().unwrap();
    drop(store);

    let fresh = file_store(dir.path()).await;
    assert_eq!(fresh.get_all().unwrap(), before);
}

#[tokio::test]
async fn test_document_location_and_format() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(dir.path()).await;
    let path = store.complete_file_path();
    assert_eq!(path, dir.path().join("config.json"));

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\n    \"size\": 25"));
}

#[tokio::test]
async fn test_mkdir_on_startup_creates_nested_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b/c");
    let store = file_store(&nested).await;
    assert!(store.complete_file_path().exists());
}

#[tokio::test]
async fn test_directory_creation_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let store = SettingsStore::new(&test_schema(), options_in(&blocker.join("settings"))).unwrap();
    let err = store.init().await.unwrap_err();
    assert!(matches!(err, StoreError::DirectoryCreation { .. }));
}

#[tokio::test]
async fn test_corrupt_document_is_replaced_by_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), b"{ definitely not json").unwrap();

    let store = file_store(dir.path()).await;
    assert_eq!(store.get_all().unwrap(), store.get_defaults());

    let on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(store.complete_file_path()).unwrap()).unwrap();
    assert_eq!(on_disk["size"], json!(25));
}

#[tokio::test]
async fn test_invalid_fields_on_disk_are_repaired() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        br#"{"size": 4, "dark": true, "theme": "neon", "nickname": "zed", "custom": [1]}"#,
    )
    .unwrap();

    let store = file_store(dir.path()).await;
    assert_eq!(store.get("size").unwrap(), Some(json!(25)));
    assert_eq!(store.get("theme").unwrap(), Some(json!("light")));
    assert_eq!(store.get("dark").unwrap(), Some(json!(true)));
    assert_eq!(store.get("nickname").unwrap(), Some(json!("zed")));
    assert_eq!(store.get("custom").unwrap(), Some(json!([1])));
    // The optional field stays absent but still resolves to its default.
    assert!(!store.has("email").unwrap());
    assert_eq!(store.get("email").unwrap(), Some(json!("user@example.com")));
}

#[test]
fn test_validate_reports_bound_and_default() {
    let (store, _) = memory_store(StoreOptions::default());

    let result = store.validate("size", &json!(55)).unwrap();
    let rendered = serde_json::to_value(&result).unwrap();
    assert_eq!(
        rendered,
        json!({
            "status": false,
            "default": 25,
            "errors": ["The 'size' field must be less than or equal to 40."]
        })
    );

    let result = store.validate("size", &json!(22)).unwrap();
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({"status": true, "default": 25, "errors": false})
    );
}

#[test]
fn test_unknown_key_is_none() {
    let (store, _) = memory_store(StoreOptions::default());
    assert_eq!(store.get("unknownKey").unwrap(), None);
    assert_eq!(
        store.validate("unknownKey", &json!({"nested": true})).unwrap(),
        ValidationResult::valid(None)
    );
}

#[test]
fn test_invalid_value_falls_back_to_default() {
    let (store, _) = memory_store(StoreOptions::default());
    store.set("theme", json!("dark")).unwrap();

    let result = store.set("theme", json!("plaid")).unwrap();
    assert!(result.is_default_applied());
    assert_eq!(store.get("theme").unwrap(), Some(json!("light")));
}

#[test]
fn test_reset_twice_notifies_once() {
    let (store, _) = memory_store(StoreOptions::default());
    store.set("dark", json!(true)).unwrap();
    let mut updates = store.subscribe();

    store.reset().unwrap();
    assert_eq!(store.get_all().unwrap(), store.get_defaults());
    store.reset().unwrap();
    assert_eq!(store.get_all().unwrap(), store.get_defaults());

    assert!(updates.try_recv().is_ok());
    assert!(updates.try_recv().is_err());
}

/// Several writes during a slow in-flight write collapse into one follow-up.
#[tokio::test]
async fn test_writes_during_pending_write_are_coalesced() {
    let doc = Arc::new(MemoryDocument::new());
    let store = SettingsStore::with_backend(&test_schema(), StoreOptions::default(), doc.clone())
        .unwrap();
    store.init().await.unwrap();
    let baseline = doc.write_count();

    doc.set_latency(Duration::from_millis(150));
    let first = {
        let store = store.clone();
        tokio::spawn(async move { store.write().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    for size in [11, 12, 13] {
        store.set("size", json!(size)).unwrap();
        let outcome = store.write().await.unwrap();
        assert_eq!(outcome, WriteOutcome::Coalesced);
    }

    assert_eq!(first.await.unwrap().unwrap(), WriteOutcome::Written);
    let physical = doc.write_count() - baseline;
    assert!(physical < 4, "expected coalescing, got {physical} writes");
    assert_eq!(doc.contents().unwrap()["size"], json!(13));
}

#[tokio::test]
async fn test_failed_write_is_reported_not_raised() {
    let doc = Arc::new(MemoryDocument::new());
    let store = SettingsStore::with_backend(&test_schema(), StoreOptions::default(), doc.clone())
        .unwrap();
    store.init().await.unwrap();

    doc.set_fail_writes(true);
    let (_, outcome) = store.set_and_write("size", json!(20)).await.unwrap();
    assert!(outcome.is_failed());
    assert_eq!(store.get("size").unwrap(), Some(json!(20)));

    doc.set_fail_writes(false);
    assert_eq!(store.write().await.unwrap(), WriteOutcome::Written);
}

#[tokio::test]
async fn test_shutdown_flushes_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(
        &test_schema(),
        options_in(dir.path()).with_write_before_quit(true),
    )
    .unwrap();
    store.init().await.unwrap();
    store.set("nickname", json!("kit")).unwrap();

    assert_eq!(store.shutdown().await, Some(WriteOutcome::Written));
    let fresh = file_store(dir.path()).await;
    assert_eq!(fresh.get("nickname").unwrap(), Some(json!("kit")));
}

#[tokio::test]
async fn test_options_loaded_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let options_path = dir.path().join("confsync.toml");
    std::fs::write(
        &options_path,
        format!(
            "file_path = {:?}\nfile_name = \"prefs\"\npretty_print = false\n",
            dir.path().join("data").display().to_string()
        ),
    )
    .unwrap();

    let options = StoreOptions::load(&options_path).unwrap();
    let store = SettingsStore::new(&test_schema(), options).unwrap();
    store.init().await.unwrap();

    let path = store.complete_file_path();
    assert_eq!(path, dir.path().join("data").join("prefs.json"));
    let text = std::fs::read_to_string(path).unwrap();
    assert!(!text.contains('\n'));
}

proptest! {
    #[test]
    fn prop_valid_size_is_stored(size in 10i64..=40) {
        let (store, _) = memory_store(StoreOptions::default());
        let result = store.set("size", json!(size)).unwrap();
        prop_assert!(result.status);
        prop_assert_eq!(store.get("size").unwrap(), Some(json!(size)));
    }

    #[test]
    fn prop_out_of_range_size_gets_default(size in prop_oneof![-1000i64..10, 41i64..1000]) {
        let (store, _) = memory_store(StoreOptions::default());
        let result = store.set("size", json!(size)).unwrap();
        prop_assert!(result.is_default_applied());
        prop_assert_eq!(store.get("size").unwrap(), Some(json!(25)));
    }
}
