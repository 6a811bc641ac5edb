//! Wire protocol for the replication RPCs.
//!
//! Every call is unary: the sender writes one framed request and reads one
//! framed response. Frames are a fixed header (magic, length, type,
//! version) followed by a bincode-encoded message payload. Field layout
//! must stay stable across peers; integers on the header are
//! little-endian.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ReplicaError, Result};

/// Protocol magic bytes: "RPLI".
pub const PROTOCOL_MAGIC: [u8; 4] = *b"RPLI";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (16 MB). Bounds per-frame memory on both peers.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Per-chunk fingerprint record.
///
/// `block_size` is the number of bytes actually hashed, which is the
/// configured block size for all chunks except a short final one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Zero-based block index.
    pub chunk_id: u64,
    /// Bytes hashed for this chunk.
    pub block_size: u64,
    /// XXH64 fingerprint of the chunk bytes.
    pub hash: u64,
}

/// Per-file manifest sent sender → receiver for `CheckDuplicates`.
///
/// The chunk sequence is dense and monotonically increasing from index 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSignature {
    /// Path relative to the configured root.
    pub relative_file_path: String,
    /// Configured block size used to split the file.
    pub block_size: u64,
    /// Total source file size in bytes.
    pub file_size: u64,
    /// POSIX permission bits of the source file.
    pub file_mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Fingerprints covering blocks `0..ceil(file_size / block_size)`.
    pub chunks: Vec<ChunkInfo>,
}

/// One chunk's bytes plus file metadata, sent sender → receiver for
/// `Replicate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    /// Path relative to the configured root.
    pub relative_file_path: String,
    /// Zero-based block index.
    pub chunk_id: u64,
    /// Configured block size (determines the write offset).
    pub block_size: u64,
    /// Declared chunk length; at most `block_size`.
    pub length: u64,
    /// Raw chunk bytes. Empty signals an attribute-only update.
    pub data_chunk: Vec<u8>,
    /// POSIX permission bits to propagate.
    pub file_mode: u32,
    /// Total source file size; the receiver truncates past it.
    pub file_size: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

impl DataPayload {
    /// Whether this payload carries no bytes and only updates attributes.
    #[must_use]
    pub fn is_attribute_only(&self) -> bool {
        self.data_chunk.is_empty()
    }
}

/// Rename/delete request.
///
/// `new_relative_file_path` is empty for deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOps {
    /// Path relative to the configured root.
    pub relative_file_path: String,
    /// Rename destination relative to the root.
    pub new_relative_file_path: String,
}

/// Liveness probe; the receiver echoes `val` unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPong {
    /// Opaque round-trip value.
    pub val: String,
}

/// Result code for every mutating RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationCode {
    /// Operation applied.
    Ok,
    /// `CheckDuplicates` found blocks that need retransmission.
    ChangesReported,
    /// `CheckDuplicates` found every block up to date.
    ChangesNotFound,
    /// Target file missing (non-fatal for deletes).
    FileNotFound,
    /// Target file could not be read.
    FileNotReadable,
    /// Target file could not be opened or changed.
    FileNotWritable,
    /// Write or rename failed mid-operation.
    UpdateError,
    /// Any other failure, including rejected paths.
    UnhandledError,
}

/// RPC response: a code plus, for `CheckDuplicates`, the chunks the
/// receiver wants retransmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Result code.
    pub code: ConfirmationCode,
    /// Requested chunks; empty for every method except `CheckDuplicates`.
    pub chunks: Vec<ChunkInfo>,
}

impl Confirmation {
    /// Confirmation carrying only a code.
    #[must_use]
    pub fn code(code: ConfirmationCode) -> Self {
        Self {
            code,
            chunks: Vec::new(),
        }
    }

    /// Confirmation with a chunk list attached.
    #[must_use]
    pub fn with_chunks(code: ConfirmationCode, chunks: Vec<ChunkInfo>) -> Self {
        Self { code, chunks }
    }
}

/// Frame type ids. Kept numerically stable for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// `CheckDuplicates` request.
    CheckDuplicates = 0x01,
    /// `Replicate` request.
    Replicate = 0x02,
    /// `Rename` request.
    Rename = 0x03,
    /// `Delete` request.
    Delete = 0x04,
    /// `Ping` request.
    Ping = 0x05,
    /// Response to any mutating request.
    Confirmation = 0x06,
    /// Response to `Ping`.
    Pong = 0x07,
}

impl MessageType {
    /// Convert from the on-wire byte.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the value is not a known frame type.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::CheckDuplicates),
            0x02 => Ok(Self::Replicate),
            0x03 => Ok(Self::Rename),
            0x04 => Ok(Self::Delete),
            0x05 => Ok(Self::Ping),
            0x06 => Ok(Self::Confirmation),
            0x07 => Ok(Self::Pong),
            _ => Err(ReplicaError::Protocol(format!(
                "Invalid message type: {value:#x}"
            ))),
        }
    }
}

/// Protocol frame header.
///
/// ```text
/// ┌─────────┬─────────┬─────────┬─────────┬─────────┐
/// │  MAGIC  │ LENGTH  │  TYPE   │ VERSION │  FLAGS  │
/// │ 4 bytes │ 4 bytes │ 1 byte  │ 1 byte  │ 2 bytes │
/// └─────────┴─────────┴─────────┴─────────┴─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic bytes: "RPLI".
    pub magic: [u8; 4],
    /// Payload length (little-endian).
    pub length: u32,
    /// Message type.
    pub msg_type: MessageType,
    /// Protocol version.
    pub version: u8,
    /// Reserved flags.
    pub flags: u16,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 12;

    /// Create a new frame header.
    #[must_use]
    pub const fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            length: payload_len,
            msg_type,
            version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    /// Validate the header.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.magic != PROTOCOL_MAGIC {
            return Err(ReplicaError::Protocol(format!(
                "Invalid magic: expected {PROTOCOL_MAGIC:?}, got {:?}",
                self.magic
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ReplicaError::Protocol(format!(
                "Unsupported version: expected {PROTOCOL_VERSION}, got {}",
                self.version
            )));
        }
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(ReplicaError::Protocol(format!(
                "Payload too large: {} > {MAX_PAYLOAD_SIZE}",
                self.length
            )));
        }
        Ok(())
    }

    /// Encode header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8] = self.msg_type as u8;
        buf[9] = self.version;
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Decode and validate a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if decoding or validation fails.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let magic: [u8; 4] = buf[0..4]
            .try_into()
            .map_err(|_| ReplicaError::Protocol("Failed to decode magic".to_string()))?;

        let length = u32::from_le_bytes(
            buf[4..8]
                .try_into()
                .map_err(|_| ReplicaError::Protocol("Failed to decode length".to_string()))?,
        );

        let msg_type = MessageType::from_u8(buf[8])?;
        let version = buf[9];

        let flags = u16::from_le_bytes(
            buf[10..12]
                .try_into()
                .map_err(|_| ReplicaError::Protocol("Failed to decode flags".to_string()))?,
        );

        let header = Self {
            magic,
            length,
            msg_type,
            version,
            flags,
        };

        header.validate()?;
        Ok(header)
    }
}

/// Unary protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Block comparison request.
    CheckDuplicates(DataSignature),
    /// Chunk write or attribute update request.
    Replicate(DataPayload),
    /// Rename request.
    Rename(FileOps),
    /// Delete (archive) request.
    Delete(FileOps),
    /// Liveness probe.
    Ping(PingPong),
    /// Response carrying a confirmation.
    Confirmation(Confirmation),
    /// Response echoing a ping.
    Pong(PingPong),
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub const fn msg_type(&self) -> MessageType {
        match self {
            Self::CheckDuplicates(_) => MessageType::CheckDuplicates,
            Self::Replicate(_) => MessageType::Replicate,
            Self::Rename(_) => MessageType::Rename,
            Self::Delete(_) => MessageType::Delete,
            Self::Ping(_) => MessageType::Ping,
            Self::Confirmation(_) => MessageType::Confirmation,
            Self::Pong(_) => MessageType::Pong,
        }
    }

    /// Encode message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| ReplicaError::Protocol(format!("Failed to encode message: {e}")))
    }

    /// Decode message from bytes.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if deserialization fails.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| ReplicaError::Protocol(format!("Failed to decode message: {e}")))
    }
}

/// Write a framed message to a stream.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn send_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.encode()?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| ReplicaError::Protocol("Payload too large for u32".to_string()))?;

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ReplicaError::Protocol(format!(
            "Payload exceeds maximum size: {payload_len} > {MAX_PAYLOAD_SIZE}"
        )));
    }

    let header = FrameHeader::new(message.msg_type(), payload_len);
    writer.write_all(&header.encode()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from a stream.
///
/// # Errors
///
/// Returns an error if reading, header validation, or decoding fails.
pub async fn recv_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut buf).await?;
    let header = FrameHeader::decode(&buf)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;

    Message::decode(&payload)
}
