//! Replication server (receiver side).
//!
//! Accepts connections, decodes unary requests, and applies them through
//! the storage engine. Operations on the same relative path are
//! serialized behind a per-path mutation lock; `CheckDuplicates` reads of
//! a path's `FileIndex` may overlap each other but never its mutations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::file_index::FileIndex;
use crate::fingerprint::chunk_fingerprint;
use crate::message::{
    recv_message, send_message, Confirmation, ConfirmationCode, DataPayload, DataSignature,
    FileOps, Message,
};
use crate::store::Store;

/// Per-path receiver state.
///
/// The mutation lock serializes `Replicate`/`Rename`/`Delete` for one
/// relative path; the index lock lets compares share read access.
#[derive(Debug, Default)]
struct PathState {
    mutation: Mutex<()>,
    index: RwLock<Option<FileIndex>>,
}

#[derive(Debug)]
struct ServerState {
    store: Store,
    paths: Mutex<HashMap<String, Arc<PathState>>>,
}

impl ServerState {
    async fn path_state(&self, relative_path: &str) -> Arc<PathState> {
        let mut paths = self.paths.lock().await;
        Arc::clone(paths.entry(relative_path.to_string()).or_default())
    }

    async fn drop_path(&self, relative_path: &str) {
        self.paths.lock().await.remove(relative_path);
    }
}

/// TCP server hosting the five replication RPCs.
#[derive(Debug)]
pub struct ReplicationServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl ReplicationServer {
    /// Bind the listener and verify the target root is a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the root is unusable or the address cannot be
    /// bound; both are fatal to the process.
    pub async fn bind(address: &str, file_root: impl Into<PathBuf>) -> Result<Self> {
        let file_root = file_root.into();
        let meta = tokio::fs::metadata(&file_root).await?;
        if !meta.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("target root is not a directory: {}", file_root.display()),
            )
            .into());
        }

        let listener = TcpListener::bind(address).await?;
        info!(address, root = %file_root.display(), "listening");

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                store: Store::new(file_root),
                paths: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The bound socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is cancelled.
    ///
    /// Each connection runs in its own task; handlers for distinct paths
    /// execute in parallel.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop itself fails.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "connection accepted");
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                handle_connection(state, stream, peer).await;
            });
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let request = match recv_message(&mut stream).await {
            Ok(message) => message,
            Err(crate::error::ReplicaError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!(%peer, "connection closed");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection");
                return;
            }
        };

        let response = dispatch(&state, request).await;
        if let Err(e) = send_message(&mut stream, &response).await {
            warn!(%peer, error = %e, "failed to send response");
            return;
        }
    }
}

async fn dispatch(state: &ServerState, request: Message) -> Message {
    match request {
        Message::CheckDuplicates(signature) => {
            Message::Confirmation(check_duplicates(state, signature).await)
        }
        Message::Replicate(payload) => Message::Confirmation(replicate(state, payload).await),
        Message::Rename(ops) => Message::Confirmation(rename(state, ops).await),
        Message::Delete(ops) => Message::Confirmation(delete(state, ops).await),
        Message::Ping(ping) => Message::Pong(ping),
        Message::Confirmation(_) | Message::Pong(_) => {
            warn!("response frame received as request");
            Message::Confirmation(Confirmation::code(ConfirmationCode::UnhandledError))
        }
    }
}

/// Compare the sender's manifest against the cached index and report the
/// chunks that need retransmission. Never mutates an existing index;
/// building one on first sight populates the cache from disk.
async fn check_duplicates(state: &ServerState, signature: DataSignature) -> Confirmation {
    if signature.block_size == 0 {
        return Confirmation::code(ConfirmationCode::UnhandledError);
    }

    let target = match state.store.resolve(&signature.relative_file_path) {
        Ok(path) => path,
        Err(e) => {
            warn!(path = %signature.relative_file_path, error = %e, "rejected path");
            return Confirmation::code(e.code());
        }
    };

    // A missing target means every block changed; that is the whole-file
    // case, not an error.
    match tokio::fs::metadata(&target).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %signature.relative_file_path, "target missing, requesting all chunks");
            return Confirmation::with_chunks(
                ConfirmationCode::ChangesReported,
                signature.chunks,
            );
        }
        Err(e) => {
            warn!(path = %signature.relative_file_path, error = %e, "failed to stat target");
            return Confirmation::code(ConfirmationCode::UnhandledError);
        }
        Ok(_) => {}
    }

    let path_state = state.path_state(&signature.relative_file_path).await;

    // Build the index on first sight (or after a block-size change); a
    // populated index is reused without touching the file.
    {
        let needs_rebuild = match &*path_state.index.read().await {
            Some(index) => index.block_size() != signature.block_size,
            None => true,
        };
        if needs_rebuild {
            let mut slot = path_state.index.write().await;
            let stale = match &*slot {
                Some(index) => index.block_size() != signature.block_size,
                None => true,
            };
            if stale {
                let mut index = FileIndex::new(
                    state.store.root(),
                    signature.relative_file_path.clone(),
                    signature.block_size,
                );
                if let Err(e) = index.regenerate().await {
                    warn!(path = %signature.relative_file_path, error = %e, "failed to read target");
                    return Confirmation::code(ConfirmationCode::FileNotReadable);
                }
                *slot = Some(index);
            }
        }
    }

    let index = path_state.index.read().await;
    let Some(index) = index.as_ref() else {
        return Confirmation::code(ConfirmationCode::UnhandledError);
    };

    let mut changed = Vec::new();
    for chunk in &signature.chunks {
        match index.lookup(chunk.chunk_id) {
            Some(hash) if hash == chunk.hash => {}
            _ => changed.push(*chunk),
        }
    }

    debug!(
        path = %signature.relative_file_path,
        total = signature.chunks.len(),
        changed = changed.len(),
        "compared chunks"
    );

    let code = if changed.is_empty() {
        ConfirmationCode::ChangesNotFound
    } else {
        ConfirmationCode::ChangesReported
    };
    Confirmation::with_chunks(code, changed)
}

/// Apply one payload: a chunk write plus index update in data mode, or a
/// chmod/chown pass in attribute mode. Serialized per path.
async fn replicate(state: &ServerState, payload: DataPayload) -> Confirmation {
    let path_state = state.path_state(&payload.relative_file_path).await;
    let _guard = path_state.mutation.lock().await;

    if payload.is_attribute_only() {
        debug!(path = %payload.relative_file_path, "attribute-only update");
        return match state.store.apply_attributes(&payload).await {
            Ok(()) => Confirmation::code(ConfirmationCode::Ok),
            Err(e) => {
                warn!(path = %payload.relative_file_path, error = %e, "attribute update failed");
                Confirmation::code(e.code())
            }
        };
    }

    if payload.block_size == 0 {
        return Confirmation::code(ConfirmationCode::UnhandledError);
    }

    match state.store.write_chunk(&payload).await {
        Ok(new_len) => {
            // Index updates follow successful writes only; a half-written
            // file must never be published in the cache.
            let mut slot = path_state.index.write().await;
            match slot.as_mut() {
                Some(index) if index.block_size() == payload.block_size => {
                    index.update(payload.chunk_id, chunk_fingerprint(&payload.data_chunk));
                    index.truncate_blocks(new_len.div_ceil(payload.block_size));
                }
                Some(_) => {
                    // Block size changed between runs; the cached table no
                    // longer lines up with the write offsets.
                    *slot = None;
                }
                None => {}
            }
            debug!(
                path = %payload.relative_file_path,
                chunk = payload.chunk_id,
                bytes = payload.data_chunk.len(),
                "chunk written"
            );
            Confirmation::code(ConfirmationCode::Ok)
        }
        Err(e) => {
            // The write may have truncated before failing; invalidate so
            // the next compare rebuilds from on-disk reality.
            *path_state.index.write().await = None;
            warn!(path = %payload.relative_file_path, chunk = payload.chunk_id, error = %e, "chunk write failed");
            Confirmation::code(e.code())
        }
    }
}

async fn rename(state: &ServerState, ops: FileOps) -> Confirmation {
    let path_state = state.path_state(&ops.relative_file_path).await;
    let _guard = path_state.mutation.lock().await;

    info!(from = %ops.relative_file_path, to = %ops.new_relative_file_path, "rename");

    match state
        .store
        .rename(&ops.relative_file_path, &ops.new_relative_file_path)
        .await
    {
        Ok(()) => {
            drop(_guard);
            // Both keys go stale: the old path no longer exists and the
            // new path's contents changed out from under any cached index.
            state.drop_path(&ops.relative_file_path).await;
            state.drop_path(&ops.new_relative_file_path).await;
            Confirmation::code(ConfirmationCode::Ok)
        }
        Err(e) => {
            warn!(from = %ops.relative_file_path, error = %e, "rename failed");
            Confirmation::code(e.code())
        }
    }
}

async fn delete(state: &ServerState, ops: FileOps) -> Confirmation {
    let path_state = state.path_state(&ops.relative_file_path).await;
    let _guard = path_state.mutation.lock().await;

    info!(path = %ops.relative_file_path, "delete");

    match state.store.archive(&ops.relative_file_path).await {
        Ok(destination) => {
            drop(_guard);
            state.drop_path(&ops.relative_file_path).await;
            debug!(archived = %destination.display(), "archived");
            Confirmation::code(ConfirmationCode::Ok)
        }
        Err(e) => {
            let code = e.code();
            if code == ConfirmationCode::FileNotFound {
                debug!(path = %ops.relative_file_path, "nothing to delete");
            } else {
                warn!(path = %ops.relative_file_path, error = %e, "delete failed");
            }
            drop(_guard);
            state.drop_path(&ops.relative_file_path).await;
            Confirmation::code(code)
        }
    }
}
