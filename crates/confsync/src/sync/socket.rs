//! Unix socket transport.
//!
//! Frames are newline-delimited JSON. A replica keeps one connection open:
//! its requests carry an ID so responses can be matched while pushes
//! interleave on the same stream.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use confsync_protocol::{
    ClientFrame, ServerFrame, SyncPush, SyncRequest, SyncResponse, decode_line, encode_line,
};

use super::host::SyncHost;
use super::link::{OwnerLink, into_result};
use crate::error::{StoreError, StoreResult};

// ============================================================================
// Server
// ============================================================================

/// Serves a [`SyncHost`] on a Unix socket.
pub struct SocketServer {
    host: SyncHost,
    listener: UnixListener,
    path: PathBuf,
}

impl SocketServer {
    /// Bind `path`, replacing a stale socket file.
    pub async fn bind(host: SyncHost, path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = tokio::fs::remove_file(&path).await;
        let listener = UnixListener::bind(&path)?;
        info!("Settings owner listening on {}", path.display());
        Ok(Self {
            host,
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    /// file.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_id = Uuid::new_v4();
                            debug!("New replica connection {}", conn_id);
                            let host = self.host.clone();
                            tokio::spawn(async move {
                                handle_connection(host, stream, conn_id).await;
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Settings owner socket shutting down");
                    break;
                }
            }
        }
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

async fn handle_connection(host: SyncHost, stream: UnixStream, conn_id: Uuid) {
    let (reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let line = match encode_line(&frame) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode server frame: {}", e);
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // Pushes for listeners registered on this connection.
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<SyncPush>();
    let forward_task = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(push) = push_rx.recv().await {
                if out_tx.send(ServerFrame::Push { push }).is_err() {
                    break;
                }
            }
        })
    };

    let mut registered = Vec::new();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Replica connection {} closed", conn_id);
                break;
            }
            Err(e) => {
                warn!("Replica connection {} read error: {}", conn_id, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: ClientFrame = match decode_line(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding malformed frame on {}: {}", conn_id, e);
                continue;
            }
        };

        let response = host.handle(frame.request, Some(&push_tx)).await;
        if let SyncResponse::Registered { listener_id } = &response {
            registered.push(*listener_id);
        }
        if out_tx
            .send(ServerFrame::Response {
                id: frame.id,
                response,
            })
            .is_err()
        {
            break;
        }
    }

    for id in registered {
        host.unregister(id);
    }
    forward_task.abort();
    // Let the writer flush queued frames; it ends once every sender is gone.
    drop(out_tx);
    let _ = writer_task.await;
}

// ============================================================================
// Client
// ============================================================================

type Pending = DashMap<u64, oneshot::Sender<SyncResponse>>;

/// Owner link over a Unix socket.
pub struct SocketLink {
    path: PathBuf,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    out_tx: mpsc::UnboundedSender<String>,
    pushes: Mutex<Option<mpsc::UnboundedReceiver<SyncPush>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketLink {
    /// Connect to the owner at `path`. The connection's IO runs on the
    /// current runtime.
    pub async fn connect(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path).await?;
        let (reader, mut writer) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_frames(
            BufReader::new(reader),
            pending.clone(),
            closed.clone(),
            push_tx,
        ));

        debug!("Connected to settings owner at {}", path.display());
        Ok(Self {
            path,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            out_tx,
            pushes: Mutex::new(Some(push_rx)),
            tasks: vec![writer_task, reader_task],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a request frame and return the receiver for its response.
    fn send(&self, request: SyncRequest) -> StoreResult<oneshot::Receiver<SyncResponse>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_line(&ClientFrame { id, request })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // The reader marks the link closed before it clears pending entries.
        if self.closed.load(Ordering::SeqCst) || self.out_tx.send(line).is_err() {
            self.pending.remove(&id);
            return Err(StoreError::Disconnected);
        }
        Ok(rx)
    }
}

#[async_trait]
impl OwnerLink for SocketLink {
    async fn request(&self, request: SyncRequest) -> StoreResult<SyncResponse> {
        let rx = self.send(request)?;
        let response = rx.await.map_err(|_| StoreError::Disconnected)?;
        into_result(response)
    }

    fn request_blocking(&self, request: SyncRequest) -> StoreResult<SyncResponse> {
        let rx = self.send(request)?;
        let response = rx.blocking_recv().map_err(|_| StoreError::Disconnected)?;
        into_result(response)
    }

    fn take_pushes(&self) -> Option<mpsc::UnboundedReceiver<SyncPush>> {
        self.pushes.lock().take()
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_frames(
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    push_tx: mpsc::UnboundedSender<SyncPush>,
) {
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Owner connection read error: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<ServerFrame>(&line) {
            Ok(ServerFrame::Response { id, response }) => match pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(response);
                }
                None => debug!("Response for unknown request {}", id),
            },
            Ok(ServerFrame::Push { push }) => {
                let _ = push_tx.send(push);
            }
            Err(e) => warn!("Discarding malformed server frame: {}", e),
        }
    }

    info!("Settings owner connection closed");
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every outstanding request.
    pending.clear();
}
