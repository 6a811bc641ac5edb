//! # Replica
//!
//! Differential directory replication over a block-signature protocol.
//!
//! A sender watches a source tree and pushes changes to a receiver, block
//! by block: only chunks whose 64-bit fingerprint differs on the receiver
//! cross the wire. Renames and deletes are replicated too, and POSIX
//! attributes (mode, owner, group) follow the data.
//!
//! ## Architecture
//!
//! - **Fingerprint**: XXH64 over each chunk's actual bytes, identical on
//!   both peers.
//! - **FileIndex**: receiver-side per-file fingerprint cache, built lazily
//!   from disk and kept in lock-step with accepted writes.
//! - **Protocol**: five unary RPCs (`CheckDuplicates`, `Replicate`,
//!   `Rename`, `Delete`, `Ping`) as length-prefixed bincode frames over
//!   TCP.
//! - **Store**: receiver storage engine — offset writes, truncation,
//!   sparse extension, attribute propagation, archival on delete.
//! - **Sender pipeline**: watcher + initial walk feeding a bounded
//!   transfer queue drained by a single worker.
//!
//! ## Example
//!
//! ```no_run
//! use replica::{FileReplicator, ReplicatorClient, ReplicatorConfig};
//!
//! # async fn example() -> replica::Result<()> {
//! let client = ReplicatorClient::connect("127.0.0.1:9130", "/srv/source", 10).await?;
//! let replicator = FileReplicator::new(client, ReplicatorConfig::default());
//!
//! // Push one file's changed blocks to the receiver.
//! replicator.process_file("reports/latest.csv").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod error;
mod file_index;
mod fingerprint;
mod message;
mod sender;
mod server;
mod store;
mod watcher;

pub use client::{ReplicatorClient, DEFAULT_RPC_DEADLINE};
pub use error::{ReplicaError, Result};
pub use file_index::{FileIndex, GAP_FINGERPRINT};
pub use fingerprint::{chunk_fingerprint, EMPTY_FINGERPRINT, FINGERPRINT_SEED};
pub use message::{
    recv_message, send_message, ChunkInfo, Confirmation, ConfirmationCode, DataPayload,
    DataSignature, FileOps, FrameHeader, Message, MessageType, PingPong, MAX_PAYLOAD_SIZE,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use sender::{FileReplicator, ReplicatorConfig};
pub use server::ReplicationServer;
pub use store::{Store, StoreError, ARCHIVE_DIR};
pub use watcher::watch;
