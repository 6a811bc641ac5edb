//! Replication client (sender side).
//!
//! A thin shim over the framed transport: one method per server RPC plus
//! `ping`. The connection is shared and calls are serialized over it;
//! every call runs under the configured deadline.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{ReplicaError, Result};
use crate::fingerprint::chunk_fingerprint;
use crate::message::{
    recv_message, send_message, ChunkInfo, Confirmation, DataPayload, DataSignature, FileOps,
    Message, PingPong,
};
use crate::store::MODE_MASK;

/// Default per-call deadline for file operations.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(10);

/// Client connection to a replication server.
#[derive(Debug)]
pub struct ReplicatorClient {
    stream: Mutex<TcpStream>,
    address: String,
    file_root: PathBuf,
    parallelism: usize,
    deadline: Duration,
}

impl ReplicatorClient {
    /// Connect to a server.
    ///
    /// `file_root` is the local source root all relative paths resolve
    /// against; `parallelism` is a hint consumed by the sender pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(
        address: &str,
        file_root: impl Into<PathBuf>,
        parallelism: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        info!(address, "connected");
        Ok(Self {
            stream: Mutex::new(stream),
            address: address.to_string(),
            file_root: file_root.into(),
            parallelism,
            deadline: DEFAULT_RPC_DEADLINE,
        })
    }

    /// Override the per-call deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// The local source root.
    #[must_use]
    pub fn file_root(&self) -> &Path {
        &self.file_root
    }

    /// The configured parallelism hint.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    async fn call(&self, operation: &'static str, request: Message) -> Result<Message> {
        let deadline = self.deadline;
        let exchange = async {
            let mut stream = self.stream.lock().await;
            send_message(&mut *stream, &request).await?;
            recv_message(&mut *stream).await
        };
        match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                // The late response may still arrive; left in place it
                // would pair with the next request. Replace the stream.
                if let Ok(fresh) = TcpStream::connect(&self.address).await {
                    *self.stream.lock().await = fresh;
                }
                Err(ReplicaError::Deadline {
                    operation,
                    seconds: deadline.as_secs(),
                })
            }
        }
    }

    async fn call_confirmed(
        &self,
        operation: &'static str,
        request: Message,
    ) -> Result<Confirmation> {
        match self.call(operation, request).await? {
            Message::Confirmation(confirmation) => Ok(confirmation),
            other => Err(ReplicaError::Protocol(format!(
                "expected Confirmation for {operation}, got {:?}",
                other.msg_type()
            ))),
        }
    }

    /// Build the local file's signature and ask the server which chunks it
    /// needs.
    ///
    /// Reads the source in block-sized chunks, fingerprinting the
    /// read-length prefix of each, and sends a dense manifest together
    /// with size, mode, and ownership.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or the call fails.
    pub async fn check_duplicates(
        &self,
        relative_path: &str,
        block_size: u64,
    ) -> Result<Confirmation> {
        if block_size == 0 {
            return Err(ReplicaError::InvalidBlockSize(block_size));
        }

        let path = self.file_root.join(relative_path);
        let mut file = File::open(&path).await?;
        let meta = file.metadata().await?;

        let mut chunks = Vec::new();
        let mut buffer = vec![0u8; block_size as usize];
        let mut chunk_id = 0u64;

        loop {
            let mut filled = 0;
            while filled < buffer.len() {
                match file.read(&mut buffer[filled..]).await? {
                    0 => break,
                    n => filled += n,
                }
            }

            if filled == 0 {
                break;
            }

            chunks.push(ChunkInfo {
                chunk_id,
                block_size: filled as u64,
                hash: chunk_fingerprint(&buffer[..filled]),
            });
            chunk_id += 1;

            if filled < buffer.len() {
                break;
            }
        }

        let signature = DataSignature {
            relative_file_path: relative_path.to_string(),
            block_size,
            file_size: meta.len(),
            file_mode: meta.mode() & MODE_MASK,
            uid: meta.uid(),
            gid: meta.gid(),
            chunks,
        };

        debug!(
            path = relative_path,
            chunks = signature.chunks.len(),
            "checking for duplicates"
        );
        self.call_confirmed("CheckDuplicates", Message::CheckDuplicates(signature))
            .await
    }

    /// Send one chunk (or an attribute-only update) to the server.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or deadline expiry; a
    /// non-success confirmation code is returned in the `Confirmation`
    /// for the caller to inspect.
    pub async fn replicate(&self, payload: DataPayload) -> Result<Confirmation> {
        self.call_confirmed("Replicate", Message::Replicate(payload))
            .await
    }

    /// Rename a file on the receiver.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or deadline expiry.
    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<Confirmation> {
        self.call_confirmed(
            "Rename",
            Message::Rename(FileOps {
                relative_file_path: old_path.to_string(),
                new_relative_file_path: new_path.to_string(),
            }),
        )
        .await
    }

    /// Archive a file on the receiver.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or deadline expiry.
    pub async fn delete_file(&self, relative_path: &str) -> Result<Confirmation> {
        self.call_confirmed(
            "Delete",
            Message::Delete(FileOps {
                relative_file_path: relative_path.to_string(),
                new_relative_file_path: String::new(),
            }),
        )
        .await
    }

    /// Round-trip a value through the server.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an unexpected response.
    pub async fn ping(&self, val: &str) -> Result<PingPong> {
        match self
            .call(
                "Ping",
                Message::Ping(PingPong {
                    val: val.to_string(),
                }),
            )
            .await?
        {
            Message::Pong(pong) => Ok(pong),
            other => Err(ReplicaError::Protocol(format!(
                "expected Pong, got {:?}",
                other.msg_type()
            ))),
        }
    }
}
