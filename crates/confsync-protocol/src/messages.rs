//! Owner/replica message catalog.
//!
//! Two message shapes exist: request/response pairs issued by a replica, and
//! one-way pushes sent by the owner whenever its settings change. Every
//! message is JSON tagged with `"type"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::values::{SettingsMap, ValidationResult, WriteOutcome};

// ============================================================================
// Requests (replica -> owner)
// ============================================================================

/// Request sent from a replica to the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncRequest {
    /// Announce this replica so it receives pushes.
    RegisterListener,

    /// Fetch the current settings and the default table in one round trip.
    GetAllAndDefaults,

    /// Blocking form of [`SyncRequest::GetAllAndDefaults`], used at startup.
    GetAllAndDefaultsSync,

    /// Check a value against the schema without storing it.
    Validate { key: String, value: Value },

    Set { key: String, value: Value },

    SetAll { values: SettingsMap },

    /// Set, then write through the coalescing async path.
    SetAndWrite { key: String, value: Value },

    /// Set, then write with a blocking write on the owner.
    SetAndWriteSync { key: String, value: Value },

    Write,

    WriteSync,

    GetAll,

    GetDefaults,

    Unset { key: String },

    /// Stop the owner's file watcher.
    DisableWatcher,

    Reset,

    ResetAndWrite,

    ResetAndWriteSync,
}

impl SyncRequest {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SyncRequest::RegisterListener => "register_listener",
            SyncRequest::GetAllAndDefaults => "get_all_and_defaults",
            SyncRequest::GetAllAndDefaultsSync => "get_all_and_defaults_sync",
            SyncRequest::Validate { .. } => "validate",
            SyncRequest::Set { .. } => "set",
            SyncRequest::SetAll { .. } => "set_all",
            SyncRequest::SetAndWrite { .. } => "set_and_write",
            SyncRequest::SetAndWriteSync { .. } => "set_and_write_sync",
            SyncRequest::Write => "write",
            SyncRequest::WriteSync => "write_sync",
            SyncRequest::GetAll => "get_all",
            SyncRequest::GetDefaults => "get_defaults",
            SyncRequest::Unset { .. } => "unset",
            SyncRequest::DisableWatcher => "disable_watcher",
            SyncRequest::Reset => "reset",
            SyncRequest::ResetAndWrite => "reset_and_write",
            SyncRequest::ResetAndWriteSync => "reset_and_write_sync",
        }
    }

    /// Whether the request may change the owner's settings.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            SyncRequest::Set { .. }
                | SyncRequest::SetAll { .. }
                | SyncRequest::SetAndWrite { .. }
                | SyncRequest::SetAndWriteSync { .. }
                | SyncRequest::Unset { .. }
                | SyncRequest::Reset
                | SyncRequest::ResetAndWrite
                | SyncRequest::ResetAndWriteSync
        )
    }
}

// ============================================================================
// Responses (owner -> replica)
// ============================================================================

/// Response from the owner to a replica request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncResponse {
    /// Listener registered; pushes will follow on this connection.
    Registered { listener_id: u64 },

    /// Current settings plus the default table. `revision` is the revision
    /// of the last push sent before the snapshot was taken.
    Snapshot {
        settings: SettingsMap,
        defaults: SettingsMap,
        revision: u64,
    },

    /// Result of `validate` or `set`.
    Validation { result: ValidationResult },

    /// Per-key results of `set_all`.
    SetAllResult {
        results: BTreeMap<String, ValidationResult>,
    },

    SetAndWritten {
        validation: ValidationResult,
        write: WriteOutcome,
    },

    Written { outcome: WriteOutcome },

    /// Result of `get_all` or `get_defaults`.
    Settings { settings: SettingsMap },

    Unset { existed: bool },

    WatcherDisabled { was_active: bool },

    Reset { changed: bool },

    ResetAndWritten { changed: bool, write: WriteOutcome },

    /// The owner could not execute the request.
    Error { message: String },
}

// ============================================================================
// Pushes (owner -> every registered replica)
// ============================================================================

/// One-way notification from the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPush {
    /// The owner's settings changed; this is the full new snapshot.
    /// Revisions increase by one per change.
    SettingsUpdated { settings: SettingsMap, revision: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_tagging() {
        let req = SyncRequest::Set {
            key: "size".to_string(),
            value: json!(30),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"type": "set", "key": "size", "value": 30}));

        let back: SyncRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_unit_request_tagging() {
        let value = serde_json::to_value(SyncRequest::ResetAndWriteSync).unwrap();
        assert_eq!(value, json!({"type": "reset_and_write_sync"}));
        assert_eq!(SyncRequest::ResetAndWriteSync.name(), "reset_and_write_sync");
    }

    #[test]
    fn test_mutating_requests() {
        assert!(SyncRequest::Reset.is_mutating());
        assert!(
            SyncRequest::Unset {
                key: "a".to_string()
            }
            .is_mutating()
        );
        assert!(!SyncRequest::GetAll.is_mutating());
        assert!(!SyncRequest::Write.is_mutating());
    }

    #[test]
    fn test_snapshot_response() {
        let mut settings = SettingsMap::new();
        settings.insert("size".to_string(), json!(30));
        let mut defaults = SettingsMap::new();
        defaults.insert("size".to_string(), json!(25));

        let resp = SyncResponse::Snapshot {
            settings,
            defaults,
            revision: 4,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["revision"], 4);
        assert_eq!(value["settings"]["size"], 30);
        assert_eq!(value["defaults"]["size"], 25);
    }

    #[test]
    fn test_push_tagging() {
        let push = SyncPush::SettingsUpdated {
            settings: SettingsMap::new(),
            revision: 7,
        };
        let value = serde_json::to_value(&push).unwrap();
        assert_eq!(
            value,
            json!({"type": "settings_updated", "settings": {}, "revision": 7})
        );
    }
}
