//! Owner-side request host.
//!
//! Executes replica requests against the owner store exactly as a local
//! caller would, and registers replicas with the change hub.

use tracing::{debug, warn};

use confsync_protocol::{SyncRequest, SyncResponse};

use super::hub::PushSender;
use crate::error::{StoreError, StoreResult};
use crate::store::SettingsStore;

#[derive(Debug, Clone)]
pub struct SyncHost {
    store: SettingsStore,
}

impl SyncHost {
    pub fn new(store: SettingsStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Drop a replica registered through this host.
    pub fn unregister(&self, listener_id: u64) {
        self.store.hub().unregister(listener_id);
    }

    /// Handle one request. `pushes` is the caller's push endpoint, needed
    /// only for `register_listener`.
    pub async fn handle(&self, request: SyncRequest, pushes: Option<&PushSender>) -> SyncResponse {
        let name = request.name();
        debug!(
            "Handling sync request {} (mutating: {})",
            name,
            request.is_mutating()
        );

        let result = match request {
            SyncRequest::RegisterListener => return self.register(pushes),
            SyncRequest::Write => self
                .store
                .write()
                .await
                .map(|outcome| SyncResponse::Written { outcome }),
            SyncRequest::SetAndWrite { key, value } => self
                .store
                .set_and_write(&key, value)
                .await
                .map(|(validation, write)| SyncResponse::SetAndWritten { validation, write }),
            SyncRequest::ResetAndWrite => self
                .store
                .reset_and_write()
                .await
                .map(|(changed, write)| SyncResponse::ResetAndWritten { changed, write }),
            blocking @ (SyncRequest::WriteSync
            | SyncRequest::SetAndWriteSync { .. }
            | SyncRequest::ResetAndWriteSync) => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || execute(&store, blocking)).await {
                    Ok(result) => result,
                    Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
                }
            }
            other => execute(&self.store, other),
        };
        into_response(name, result)
    }

    /// Blocking form of [`SyncHost::handle`]. Write requests use the
    /// owner's blocking write path.
    pub fn handle_blocking(&self, request: SyncRequest, pushes: Option<&PushSender>) -> SyncResponse {
        let name = request.name();
        debug!(
            "Handling blocking sync request {} (mutating: {})",
            name,
            request.is_mutating()
        );

        if matches!(request, SyncRequest::RegisterListener) {
            return self.register(pushes);
        }
        into_response(name, execute(&self.store, request))
    }

    fn register(&self, pushes: Option<&PushSender>) -> SyncResponse {
        match pushes {
            Some(tx) => SyncResponse::Registered {
                listener_id: self.store.hub().register_sender(tx.clone()),
            },
            None => SyncResponse::Error {
                message: "register_listener needs a push channel".to_string(),
            },
        }
    }
}

/// Run a request with blocking semantics.
fn execute(store: &SettingsStore, request: SyncRequest) -> StoreResult<SyncResponse> {
    Ok(match request {
        SyncRequest::RegisterListener => {
            return Err(StoreError::UnexpectedResponse("register_listener"));
        }
        SyncRequest::GetAllAndDefaults | SyncRequest::GetAllAndDefaultsSync => {
            let (settings, revision) = store.get_all_with_revision()?;
            SyncResponse::Snapshot {
                settings,
                defaults: store.get_defaults(),
                revision,
            }
        }
        SyncRequest::Validate { key, value } => SyncResponse::Validation {
            result: store.validate(&key, &value)?,
        },
        SyncRequest::Set { key, value } => SyncResponse::Validation {
            result: store.set(&key, value)?,
        },
        SyncRequest::SetAll { values } => SyncResponse::SetAllResult {
            results: store.set_all(values)?,
        },
        SyncRequest::SetAndWrite { key, value } | SyncRequest::SetAndWriteSync { key, value } => {
            let (validation, write) = store.set_and_write_sync(&key, value)?;
            SyncResponse::SetAndWritten { validation, write }
        }
        SyncRequest::Write | SyncRequest::WriteSync => SyncResponse::Written {
            outcome: store.write_sync()?,
        },
        SyncRequest::GetAll => SyncResponse::Settings {
            settings: store.get_all()?,
        },
        SyncRequest::GetDefaults => SyncResponse::Settings {
            settings: store.get_defaults(),
        },
        SyncRequest::Unset { key } => SyncResponse::Unset {
            existed: store.unset(&key)?,
        },
        SyncRequest::DisableWatcher => SyncResponse::WatcherDisabled {
            was_active: store.disable_file_watcher(),
        },
        SyncRequest::Reset => SyncResponse::Reset {
            changed: store.reset()?,
        },
        SyncRequest::ResetAndWrite | SyncRequest::ResetAndWriteSync => {
            let (changed, write) = store.reset_and_write_sync()?;
            SyncResponse::ResetAndWritten { changed, write }
        }
    })
}

fn into_response(name: &str, result: StoreResult<SyncResponse>) -> SyncResponse {
    result.unwrap_or_else(|e| {
        warn!("Sync request {} failed: {}", name, e);
        SyncResponse::Error {
            message: e.to_string(),
        }
    })
}
