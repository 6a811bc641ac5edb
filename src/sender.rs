//! Sender pipeline.
//!
//! A `FileReplicator` turns change notifications into ordered replication
//! calls: `process_file` asks the receiver which blocks changed and
//! enqueues the answers as payloads on a bounded queue, a single transfer
//! worker drains that queue one `Replicate` at a time, and rename/delete
//! events bypass the queue as direct RPCs.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::ReplicatorClient;
use crate::error::{ReplicaError, Result};
use crate::message::{ConfirmationCode, DataPayload};
use crate::store::MODE_MASK;

/// Sender-side configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Block size used to split files (bytes).
    pub block_size: u64,
    /// Upper bound on concurrently processed watcher events.
    pub parallelism: usize,
    /// Transfer queue capacity; producers block when it is full.
    pub queue_capacity: usize,
    /// Window within which a RENAME-FROM pairs with a RENAME-TO.
    pub rename_window: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            block_size: 8192,
            parallelism: 10,
            queue_capacity: 1024,
            rename_window: Duration::from_millis(500),
        }
    }
}

/// Sender-side replication driver over one client connection.
#[derive(Debug)]
pub struct FileReplicator {
    client: Arc<ReplicatorClient>,
    queue: mpsc::Sender<DataPayload>,
    config: ReplicatorConfig,
}

impl FileReplicator {
    /// Create the replicator and start its transfer worker.
    ///
    /// The worker drains the queue for the lifetime of the returned value;
    /// it exits once the replicator is dropped and the queue empties.
    #[must_use]
    pub fn new(client: ReplicatorClient, config: ReplicatorConfig) -> Self {
        let client = Arc::new(client);
        let (queue, rx) = mpsc::channel(config.queue_capacity);
        tokio::spawn(transfer_worker(Arc::clone(&client), rx));
        Self {
            client,
            queue,
            config,
        }
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &ReplicatorClient {
        &self.client
    }

    /// The sender configuration.
    #[must_use]
    pub const fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Compare one source file against the receiver and enqueue payloads
    /// for every chunk the receiver reported changed.
    ///
    /// Returns the number of enqueued payloads. If the source grew after
    /// the manifest was taken, the extra blocks ride a later write event;
    /// a single pass does not chase a moving target.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or the compare call
    /// fails.
    pub async fn process_file(&self, relative_path: &str) -> Result<usize> {
        debug!(path = relative_path, "processing file");

        let change = self
            .client
            .check_duplicates(relative_path, self.config.block_size)
            .await?;

        if change.code == ConfirmationCode::ChangesNotFound {
            debug!(path = relative_path, "no changes");
            return Ok(0);
        }

        let path = self.client.file_root().join(relative_path);
        let mut file = File::open(&path).await?;
        let meta = file.metadata().await?;

        let block_size = self.config.block_size;
        let mut buffer = vec![0u8; block_size as usize];
        let mut enqueued = 0;

        for chunk in &change.chunks {
            file.seek(std::io::SeekFrom::Start(chunk.chunk_id * block_size))
                .await?;

            let mut filled = 0;
            while filled < buffer.len() {
                match file.read(&mut buffer[filled..]).await? {
                    0 => break,
                    n => filled += n,
                }
            }

            if filled == 0 {
                // The file shrank since the manifest; an empty payload
                // would read as attribute-only on the wire, so skip it.
                warn!(path = relative_path, chunk = chunk.chunk_id, "chunk vanished, skipping");
                continue;
            }

            let payload = DataPayload {
                relative_file_path: relative_path.to_string(),
                chunk_id: chunk.chunk_id,
                block_size,
                length: filled as u64,
                data_chunk: buffer[..filled].to_vec(),
                file_mode: meta.mode() & MODE_MASK,
                file_size: meta.len(),
                uid: meta.uid(),
                gid: meta.gid(),
            };

            // Blocks when the queue is full; backpressure, not loss.
            self.queue
                .send(payload)
                .await
                .map_err(|_| ReplicaError::Protocol("transfer worker stopped".to_string()))?;
            enqueued += 1;
        }

        debug!(path = relative_path, enqueued, "chunks enqueued");
        Ok(enqueued)
    }

    /// Propagate mode and ownership of a source file without data.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be stat'ed, the call fails,
    /// or the receiver rejects the update.
    pub async fn update_ownership(&self, relative_path: &str) -> Result<()> {
        let meta = tokio::fs::metadata(self.client.file_root().join(relative_path)).await?;

        let confirmation = self
            .client
            .replicate(DataPayload {
                relative_file_path: relative_path.to_string(),
                chunk_id: 0,
                block_size: 0,
                length: 0,
                data_chunk: Vec::new(),
                file_mode: meta.mode() & MODE_MASK,
                file_size: meta.len(),
                uid: meta.uid(),
                gid: meta.gid(),
            })
            .await?;

        if confirmation.code != ConfirmationCode::Ok {
            return Err(ReplicaError::Remote {
                operation: "Replicate",
                code: confirmation.code,
            });
        }
        Ok(())
    }

    /// Propagate a rename to the receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the receiver rejects it.
    pub async fn rename_file(&self, relative_path: &str, new_relative_path: &str) -> Result<()> {
        let confirmation = self
            .client
            .rename_file(relative_path, new_relative_path)
            .await?;
        if confirmation.code != ConfirmationCode::Ok {
            return Err(ReplicaError::Remote {
                operation: "Rename",
                code: confirmation.code,
            });
        }
        Ok(())
    }

    /// Propagate a deletion to the receiver.
    ///
    /// A `FILE_NOT_FOUND` answer is treated as success: the file is gone
    /// either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the receiver reports a
    /// failure other than a missing file.
    pub async fn delete_file(&self, relative_path: &str) -> Result<()> {
        let confirmation = self.client.delete_file(relative_path).await?;
        match confirmation.code {
            ConfirmationCode::Ok | ConfirmationCode::FileNotFound => Ok(()),
            code => Err(ReplicaError::Remote {
                operation: "Delete",
                code,
            }),
        }
    }

    /// Walk the source root and process every regular file once.
    ///
    /// Per-file failures are logged and skipped; the walk itself only
    /// fails if the root cannot be enumerated.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be read.
    pub async fn sync_source(&self) -> Result<()> {
        let root = self.client.file_root().to_path_buf();
        info!(root = %root.display(), "starting initial sync");

        let files = tokio::task::spawn_blocking(move || enumerate_files(&root))
            .await
            .map_err(|e| ReplicaError::Protocol(format!("walker task failed: {e}")))??;

        for relative_path in files {
            if let Err(e) = self.process_file(&relative_path).await {
                error!(path = relative_path, error = %e, "initial sync failed for file");
            }
        }

        info!("initial sync complete");
        Ok(())
    }
}

fn enumerate_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            ReplicaError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walk error")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        files.push(relative.to_string_lossy().into_owned());
    }
    Ok(files)
}

/// Single consumer draining the transfer queue, one payload at a time.
///
/// A blocking receive, not a poll loop: the worker parks until a payload
/// arrives. Individual failures are logged and the next payload proceeds.
async fn transfer_worker(client: Arc<ReplicatorClient>, mut rx: mpsc::Receiver<DataPayload>) {
    while let Some(payload) = rx.recv().await {
        let path = payload.relative_file_path.clone();
        let chunk_id = payload.chunk_id;
        match client.replicate(payload).await {
            Ok(confirmation) if confirmation.code == ConfirmationCode::Ok => {
                debug!(path, chunk = chunk_id, "chunk replicated");
            }
            Ok(confirmation) => {
                warn!(path, chunk = chunk_id, code = ?confirmation.code, "replication rejected");
            }
            Err(e) => {
                warn!(path, chunk = chunk_id, error = %e, "replication failed");
            }
        }
    }
    debug!("transfer queue closed");
}
