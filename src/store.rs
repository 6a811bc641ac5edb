//! Receiver storage engine.
//!
//! Applies chunk writes at computed offsets, truncates to declared sizes,
//! propagates POSIX attributes, renames in place, and archives deletions
//! under `.archive/`. Every relative path is resolved against the root and
//! rejected if it escapes; this is an invariant of the engine, not an
//! option.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, DirBuilder, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::message::{ConfirmationCode, DataPayload};

/// Directory under the root where deleted files are moved.
pub const ARCHIVE_DIR: &str = ".archive";

/// Mode of the archive root, created on demand.
const ARCHIVE_ROOT_MODE: u32 = 0o755;

/// Mode of intermediate archive directories.
const ARCHIVE_SUBDIR_MODE: u32 = 0o750;

/// Permission bits considered when comparing or applying modes.
///
/// `st_mode` carries file-type bits above these; comparing raw values
/// would report a difference on every regular file.
pub(crate) const MODE_MASK: u32 = 0o7777;

/// Storage-layer failures, each mapping onto one confirmation code.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The relative path resolves outside the root.
    #[error("path escapes root: {0}")]
    Escape(String),

    /// The target file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The target exists but could not be read or stat'ed.
    #[error("file not readable: {0}")]
    NotReadable(#[source] std::io::Error),

    /// The target could not be opened, truncated, chmod'ed or chown'ed.
    #[error("file not writable: {0}")]
    NotWritable(#[source] std::io::Error),

    /// A write or rename failed mid-operation.
    #[error("update failed: {0}")]
    UpdateFailed(#[source] std::io::Error),
}

impl StoreError {
    /// The confirmation code reported to the sender for this failure.
    #[must_use]
    pub fn code(&self) -> ConfirmationCode {
        match self {
            Self::Escape(_) => ConfirmationCode::UnhandledError,
            Self::NotFound(_) => ConfirmationCode::FileNotFound,
            Self::NotReadable(_) => ConfirmationCode::FileNotReadable,
            Self::NotWritable(_) => ConfirmationCode::FileNotWritable,
            Self::UpdateFailed(_) => ConfirmationCode::UpdateError,
        }
    }
}

/// File-mutation engine rooted at the receiver's target directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The configured root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a relative path, rejecting anything that escapes the root.
    ///
    /// Absolute paths and `..` segments that would pop past the root are
    /// refused outright rather than silently stripped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Escape`] on an escaping or absolute path.
    pub fn normalize(&self, relative: &str) -> Result<PathBuf, StoreError> {
        let mut normalized = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StoreError::Escape(relative.to_string()));
                    }
                }
                Component::Prefix(_) | Component::RootDir => {
                    return Err(StoreError::Escape(relative.to_string()));
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StoreError::Escape(relative.to_string()));
        }
        Ok(normalized)
    }

    /// Resolve a relative path to an absolute one inside the root.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Escape`] on an escaping path.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(self.normalize(relative)?))
    }

    /// Apply one data-mode payload: open-or-create the target with the
    /// payload's mode, truncate past the declared file size, extend
    /// sparsely up to the write offset, then seek and write the chunk.
    ///
    /// Returns the resulting file length so callers can keep their block
    /// accounting in line with the on-disk state.
    ///
    /// # Errors
    ///
    /// Open/truncate failures map to `FILE_NOT_WRITABLE`, write failures
    /// to `UPDATE_ERROR`.
    pub async fn write_chunk(&self, payload: &DataPayload) -> Result<u64, StoreError> {
        let target = self.resolve(&payload.relative_file_path)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(StoreError::NotWritable)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(payload.file_mode & MODE_MASK)
            .open(&target)
            .await
            .map_err(StoreError::NotWritable)?;

        let mut current_len = file
            .metadata()
            .await
            .map_err(StoreError::NotWritable)?
            .len();

        if current_len > payload.file_size {
            debug!(
                path = %payload.relative_file_path,
                from = current_len,
                to = payload.file_size,
                "truncating past declared size"
            );
            file.set_len(payload.file_size)
                .await
                .map_err(StoreError::NotWritable)?;
            current_len = payload.file_size;
        }

        let offset = payload.block_size * payload.chunk_id;
        if current_len < offset {
            // Extends as a sparse region; the gap is zero-filled.
            file.set_len(offset).await.map_err(StoreError::NotWritable)?;
        }

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(StoreError::UpdateFailed)?;
        file.write_all(&payload.data_chunk)
            .await
            .map_err(StoreError::UpdateFailed)?;
        file.flush().await.map_err(StoreError::UpdateFailed)?;

        Ok(current_len
            .max(offset)
            .max(offset + payload.data_chunk.len() as u64))
    }

    /// Apply an attribute-only payload: chmod when the mode differs, chown
    /// when the owner or group differs, and skip whatever already matches.
    ///
    /// # Errors
    ///
    /// Stat failures map to `FILE_NOT_READABLE`; chmod/chown failures to
    /// `FILE_NOT_WRITABLE`.
    pub async fn apply_attributes(&self, payload: &DataPayload) -> Result<(), StoreError> {
        let target = self.resolve(&payload.relative_file_path)?;

        let meta = fs::metadata(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(payload.relative_file_path.clone())
            } else {
                StoreError::NotReadable(e)
            }
        })?;

        let wanted_mode = payload.file_mode & MODE_MASK;
        if meta.permissions().mode() & MODE_MASK != wanted_mode {
            debug!(path = %payload.relative_file_path, mode = wanted_mode, "applying mode");
            fs::set_permissions(&target, std::fs::Permissions::from_mode(wanted_mode))
                .await
                .map_err(StoreError::NotWritable)?;
        }

        if meta.uid() != payload.uid || meta.gid() != payload.gid {
            debug!(
                path = %payload.relative_file_path,
                uid = payload.uid,
                gid = payload.gid,
                "applying ownership"
            );
            std::os::unix::fs::chown(&target, Some(payload.uid), Some(payload.gid))
                .map_err(StoreError::NotWritable)?;
        }

        Ok(())
    }

    /// Atomically rename `from` to `to` within the root.
    ///
    /// # Errors
    ///
    /// Any rename failure, including a missing source, maps to
    /// `UPDATE_ERROR`.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;

        fs::rename(&from_path, &to_path)
            .await
            .map_err(StoreError::UpdateFailed)
    }

    /// Move `relative` into the archive tree, reproducing its directory
    /// structure beneath `.archive/`. Returns the archive destination.
    ///
    /// # Errors
    ///
    /// A missing source maps to `FILE_NOT_FOUND` (non-fatal); directory
    /// creation or rename failures map to `UPDATE_ERROR`.
    pub async fn archive(&self, relative: &str) -> Result<PathBuf, StoreError> {
        let normalized = self.normalize(relative)?;
        let source = self.root.join(&normalized);
        let archive_root = self.root.join(ARCHIVE_DIR);

        if fs::metadata(&archive_root).await.is_err() {
            DirBuilder::new()
                .mode(ARCHIVE_ROOT_MODE)
                .create(&archive_root)
                .await
                .map_err(StoreError::UpdateFailed)?;
        }

        let destination = archive_root.join(&normalized);
        if let Some(parent) = destination.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(ARCHIVE_SUBDIR_MODE)
                .create(parent)
                .await
                .map_err(StoreError::UpdateFailed)?;
        }

        match fs::rename(&source, &destination).await {
            Ok(()) => Ok(destination),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(relative.to_string()))
            }
            Err(e) => Err(StoreError::UpdateFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(path: &str, chunk_id: u64, data: &[u8], file_size: u64) -> DataPayload {
        DataPayload {
            relative_file_path: path.to_string(),
            chunk_id,
            block_size: 4,
            length: data.len() as u64,
            data_chunk: data.to_vec(),
            file_mode: 0o644,
            file_size,
            uid: 0,
            gid: 0,
        }
    }

    // ==========================================================================
    // PATH CONTAINMENT
    // ==========================================================================

    #[test]
    fn resolve_plain_path() {
        let store = Store::new("/data");
        assert_eq!(
            store.resolve("a/b.txt").unwrap(),
            PathBuf::from("/data/a/b.txt")
        );
    }

    #[test]
    fn resolve_rejects_escape() {
        let store = Store::new("/data");
        assert!(matches!(
            store.resolve("../outside.txt"),
            Err(StoreError::Escape(_))
        ));
        assert!(matches!(
            store.resolve("a/../../outside.txt"),
            Err(StoreError::Escape(_))
        ));
    }

    #[test]
    fn resolve_rejects_absolute() {
        let store = Store::new("/data");
        assert!(matches!(
            store.resolve("/etc/passwd"),
            Err(StoreError::Escape(_))
        ));
    }

    #[test]
    fn resolve_allows_interior_parent_segments() {
        let store = Store::new("/data");
        assert_eq!(
            store.resolve("a/../b.txt").unwrap(),
            PathBuf::from("/data/b.txt")
        );
    }

    #[test]
    fn resolve_rejects_empty() {
        let store = Store::new("/data");
        assert!(store.resolve("").is_err());
        assert!(store.resolve(".").is_err());
    }

    #[test]
    fn escape_maps_to_unhandled_error() {
        let store = Store::new("/data");
        let err = store.resolve("..").unwrap_err();
        assert_eq!(err.code(), ConfirmationCode::UnhandledError);
    }

    // ==========================================================================
    // CHUNK WRITES
    // ==========================================================================

    #[tokio::test]
    async fn write_chunk_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store
            .write_chunk(&payload("t.txt", 0, b"abc1", 4))
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("t.txt")).unwrap(), b"abc1");
    }

    #[tokio::test]
    async fn write_chunk_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let len = store
            .write_chunk(&payload("t.txt", 0, b"abc1", 8))
            .await
            .unwrap();
        assert_eq!(len, 4);
        let len = store
            .write_chunk(&payload("t.txt", 1, b"def2", 8))
            .await
            .unwrap();
        assert_eq!(len, 8);

        assert_eq!(std::fs::read(dir.path().join("t.txt")).unwrap(), b"abc1def2");
    }

    #[tokio::test]
    async fn write_chunk_truncates_longer_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.txt"), b"abc1def2ghi3").unwrap();
        let store = Store::new(dir.path());

        // Declared size 8: the trailing block must go away.
        store
            .write_chunk(&payload("t.txt", 0, b"abc1", 8))
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("t.txt")).unwrap(), b"abc1def2");
    }

    #[tokio::test]
    async fn write_chunk_extends_sparsely() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        // First write lands at block 2 of an empty file.
        store
            .write_chunk(&payload("t.txt", 2, b"ghi3", 12))
            .await
            .unwrap();

        let contents = std::fs::read(dir.path().join("t.txt")).unwrap();
        assert_eq!(contents.len(), 12);
        assert_eq!(&contents[..8], &[0u8; 8]);
        assert_eq!(&contents[8..], b"ghi3");
    }

    #[tokio::test]
    async fn write_chunk_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store
            .write_chunk(&payload("first/second/t.txt", 0, b"abc1", 4))
            .await
            .unwrap();

        assert!(dir.path().join("first/second/t.txt").is_file());
    }

    #[tokio::test]
    async fn write_chunk_applies_creation_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut p = payload("t.txt", 0, b"abc1", 4);
        p.file_mode = 0o600;
        store.write_chunk(&p).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("t.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & MODE_MASK, 0o600);
    }

    // ==========================================================================
    // ATTRIBUTES
    // ==========================================================================

    #[tokio::test]
    async fn attributes_chmod_when_differs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.txt"), b"same").unwrap();
        let store = Store::new(dir.path());

        let meta = std::fs::metadata(dir.path().join("t.txt")).unwrap();
        let mut p = payload("t.txt", 0, b"", 4);
        p.file_mode = 0o744;
        // Current owner, so no chown is attempted.
        p.uid = meta.uid();
        p.gid = meta.gid();
        store.apply_attributes(&p).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("t.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & MODE_MASK, 0o744);
    }

    #[tokio::test]
    async fn attributes_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let err = store
            .apply_attributes(&payload("missing.txt", 0, b"", 0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ConfirmationCode::FileNotFound);
    }

    // ==========================================================================
    // RENAME AND ARCHIVE
    // ==========================================================================

    #[tokio::test]
    async fn rename_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("first/second")).unwrap();
        std::fs::write(dir.path().join("first/second/test.txt"), b"x").unwrap();
        let store = Store::new(dir.path());

        store
            .rename("first/second/test.txt", "first/second/renamed_test.txt")
            .await
            .unwrap();

        assert!(!dir.path().join("first/second/test.txt").exists());
        assert!(dir.path().join("first/second/renamed_test.txt").is_file());
    }

    #[tokio::test]
    async fn rename_missing_source_is_update_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let err = store.rename("no.txt", "yes.txt").await.unwrap_err();
        assert_eq!(err.code(), ConfirmationCode::UpdateError);
    }

    #[tokio::test]
    async fn archive_moves_deep_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("first/second")).unwrap();
        std::fs::write(dir.path().join("first/second/test.txt"), b"payload").unwrap();
        let store = Store::new(dir.path());

        let dest = store.archive("first/second/test.txt").await.unwrap();

        assert!(!dir.path().join("first/second/test.txt").exists());
        assert_eq!(
            dest,
            dir.path().join(".archive/first/second/test.txt")
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn archive_directory_modes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/f.txt"), b"x").unwrap();
        let store = Store::new(dir.path());

        store.archive("sub/f.txt").await.unwrap();

        let root_mode = std::fs::metadata(dir.path().join(".archive"))
            .unwrap()
            .permissions()
            .mode();
        let sub_mode = std::fs::metadata(dir.path().join(".archive/sub"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(root_mode & MODE_MASK, ARCHIVE_ROOT_MODE);
        assert_eq!(sub_mode & MODE_MASK, ARCHIVE_SUBDIR_MODE);
    }

    #[tokio::test]
    async fn archive_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let err = store.archive("missing.txt").await.unwrap_err();
        assert_eq!(err.code(), ConfirmationCode::FileNotFound);
    }
}
