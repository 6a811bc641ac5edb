//! Receiver-side signature cache.
//!
//! A `FileIndex` holds one fingerprint per block of a target file, built
//! lazily from the on-disk contents and kept in lock-step with accepted
//! writes. It lets `CheckDuplicates` answer from memory instead of
//! re-reading the target on every compare.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::fingerprint::chunk_fingerprint;

/// Sentinel fingerprint for blocks the receiver has never seen.
///
/// Written when `update` is called past the end of the table; it will not
/// match any real chunk, so a later `CheckDuplicates` re-requests the gap.
pub const GAP_FINGERPRINT: u64 = 0;

/// Per-file ordered table of chunk fingerprints.
#[derive(Debug, Clone)]
pub struct FileIndex {
    file_root: PathBuf,
    relative_path: String,
    block_size: u64,
    hash_table: Vec<u64>,
}

impl FileIndex {
    /// Create an empty index for `relative_path` under `file_root`.
    #[must_use]
    pub fn new(file_root: impl Into<PathBuf>, relative_path: impl Into<String>, block_size: u64) -> Self {
        Self {
            file_root: file_root.into(),
            relative_path: relative_path.into(),
            block_size,
            hash_table: Vec::new(),
        }
    }

    /// Block size the table was built with.
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks currently indexed.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.hash_table.len() as u64
    }

    /// Absolute path of the indexed file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.file_root.join(&self.relative_path)
    }

    /// Look up the fingerprint for a block.
    ///
    /// Returns `None` when the index is shorter than `chunk_id + 1`.
    #[must_use]
    pub fn lookup(&self, chunk_id: u64) -> Option<u64> {
        usize::try_from(chunk_id)
            .ok()
            .and_then(|i| self.hash_table.get(i).copied())
    }

    /// Rebuild the table from the current on-disk file.
    ///
    /// Reads the file in block-sized chunks and appends one fingerprint per
    /// non-empty read; a short final read is hashed on its read-length
    /// prefix only.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be opened or a
    /// read fails before end of file.
    pub async fn regenerate(&mut self) -> std::io::Result<()> {
        let path = self.path();
        self.regenerate_from(&path).await
    }

    async fn regenerate_from(&mut self, path: &Path) -> std::io::Result<()> {
        let mut file = File::open(path).await?;
        let mut buffer = vec![0u8; self.block_size as usize];

        self.hash_table.clear();

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

            self.hash_table.push(chunk_fingerprint(&buffer[..filled]));

            if filled < buffer.len() {
                break;
            }
        }

        Ok(())
    }

    /// Drop entries past `count` blocks.
    ///
    /// Called after an accepted write shrank the file; entries beyond the
    /// on-disk block count would otherwise report blocks the file no
    /// longer has.
    pub fn truncate_blocks(&mut self, count: u64) {
        if count < self.hash_table.len() as u64 {
            self.hash_table.truncate(count as usize);
        }
    }

    /// Record the fingerprint of an accepted write.
    ///
    /// Overwrites in place when the block is already indexed, appends when
    /// it is the next block, and pads with [`GAP_FINGERPRINT`] when the
    /// sender skipped ahead so the gap blocks stay re-requestable.
    pub fn update(&mut self, chunk_id: u64, hash: u64) {
        let len = self.hash_table.len() as u64;
        if chunk_id < len {
            self.hash_table[chunk_id as usize] = hash;
        } else {
            self.hash_table.resize(chunk_id as usize, GAP_FINGERPRINT);
            self.hash_table.push(hash);
        }
    }
}
