//! Replica-side links to the owner.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use confsync_protocol::{SyncPush, SyncRequest, SyncResponse};

use super::host::SyncHost;
use super::hub::PushSender;
use crate::error::{StoreError, StoreResult};

/// Request path from a replica to its owner.
#[async_trait]
pub trait OwnerLink: Send + Sync {
    /// Send a request and wait for the owner's answer. An `error` response
    /// becomes [`StoreError::Remote`].
    async fn request(&self, request: SyncRequest) -> StoreResult<SyncResponse>;

    /// Blocking form of [`OwnerLink::request`]. Must not be called from
    /// async code.
    fn request_blocking(&self, request: SyncRequest) -> StoreResult<SyncResponse>;

    /// Take the push stream. Returns `None` after the first call.
    fn take_pushes(&self) -> Option<mpsc::UnboundedReceiver<SyncPush>>;
}

/// Turn an `error` response into an error.
pub(crate) fn into_result(response: SyncResponse) -> StoreResult<SyncResponse> {
    match response {
        SyncResponse::Error { message } => Err(StoreError::Remote(message)),
        other => Ok(other),
    }
}

/// Link to an owner in the same process.
pub struct LocalLink {
    host: SyncHost,
    push_tx: PushSender,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncPush>>>,
}

impl LocalLink {
    pub fn new(host: SyncHost) -> Self {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Self {
            host,
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
        }
    }
}

#[async_trait]
impl OwnerLink for LocalLink {
    async fn request(&self, request: SyncRequest) -> StoreResult<SyncResponse> {
        into_result(self.host.handle(request, Some(&self.push_tx)).await)
    }

    fn request_blocking(&self, request: SyncRequest) -> StoreResult<SyncResponse> {
        into_result(self.host.handle_blocking(request, Some(&self.push_tx)))
    }

    fn take_pushes(&self) -> Option<mpsc::UnboundedReceiver<SyncPush>> {
        self.push_rx.lock().take()
    }
}
