//! # Storage backend contract
//!
//! The engine persists everything — entity payloads, index snapshots,
//! tombstones, the catalog — through one capability interface:
//! [`StorageBackend`]. The core never touches the filesystem directly,
//! which keeps the read/write path testable and lets hosts swap in
//! object stores.
//!
//! ## Contract
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | `read`    | full contents; [`StorageError::NotFound`] when absent |
//! | `write`   | create or replace, atomically |
//! | `exists`  | cheap presence probe |
//! | `delete`  | idempotent; absent paths are a no-op |
//! | `list`    | all paths under a prefix, sorted |
//! | `stat`    | `Some(size, modified_at)` or `None` when absent |
//!
//! Paths are relative, `/`-separated, and validated with
//! [`validate_file_path`](crate::validate::validate_file_path) before
//! touching the backing store.
//!
//! Two implementations ship:
//!
//! - [`FsBackend`] — a directory-rooted filesystem backend. Writes go
//!   to a `.tmp` sibling and are atomically renamed into place, so a
//!   crash mid-write leaves either the old contents or a stray
//!   temporary, never a torn file.
//! - [`MemoryBackend`] — an in-memory map honoring the same contract,
//!   used by unit tests and ephemeral hosts.
//!
//! The trait is synchronous; an async host treats every call as a
//! suspension point and wraps it at its own boundary.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::validate::{ValidateError, validate_file_path};

/// Suffix for in-flight writes; a crash may leave these behind and the
/// caller cleans them up on open.
pub const TMP_SUFFIX: &str = ".tmp";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A required read targeted an absent path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path failed validation before reaching the backing store.
    #[error("invalid storage path: {0}")]
    InvalidPath(#[from] ValidateError),

    /// Underlying I/O failure, propagated unmodified.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Trait
// ------------------------------------------------------------------------------------------------

/// Metadata returned by [`StorageBackend::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// Last modification instant.
    pub modified_at: DateTime<Utc>,
}

/// Abstract read/write/list capability over files.
pub trait StorageBackend: Send + Sync {
    /// Reads the full contents at `path`.
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Creates or atomically replaces the contents at `path`.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Returns whether `path` exists.
    fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Deletes `path`; absent paths are a no-op.
    fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Lists all stored paths starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Returns size and modification time, or `None` when absent.
    fn stat(&self, path: &str) -> Result<Option<FileStat>, StorageError>;
}

// ------------------------------------------------------------------------------------------------
// FsBackend
// ------------------------------------------------------------------------------------------------

/// Filesystem backend rooted at a directory.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Opens (creating if needed) a backend rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_file_path(path)?;
        Ok(self.root.join(path))
    }

    fn collect(
        &self,
        dir: &Path,
        rel: &str,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.collect(&entry.path(), &child_rel, prefix, out)?;
            } else if child_rel.starts_with(prefix) && !child_rel.ends_with(TMP_SUFFIX) {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

impl StorageBackend for FsBackend {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-ahead naming: land on a temporary sibling, fsync, then
        // atomically rename into place.
        let tmp = full.with_extension(match full.extension() {
            Some(ext) => format!("{}{}", ext.to_string_lossy(), TMP_SUFFIX),
            None => TMP_SUFFIX.trim_start_matches('.').to_string(),
        });
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &full)?;
        debug!(path, len = bytes.len(), "storage write");
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(path)?.exists())
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        self.collect(&self.root, "", prefix, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn stat(&self, path: &str) -> Result<Option<FileStat>, StorageError> {
        let full = self.resolve(path)?;
        match fs::metadata(&full) {
            Ok(meta) => {
                let modified_at = meta.modified().map(DateTime::<Utc>::from)?;
                Ok(Some(FileStat {
                    size: meta.len(),
                    modified_at,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MemoryBackend
// ------------------------------------------------------------------------------------------------

/// In-memory backend for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryBackend {
    files: RwLock<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, (Vec<u8>, DateTime<Utc>)>> {
        self.files.read().unwrap_or_else(|e| e.into_inner())
    }

    fn guard_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, (Vec<u8>, DateTime<Utc>)>> {
        self.files.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_file_path(path)?;
        self.guard()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_file_path(path)?;
        self.guard_mut()
            .insert(path.to_string(), (bytes.to_vec(), Utc::now()));
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_file_path(path)?;
        Ok(self.guard().contains_key(path))
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_file_path(path)?;
        self.guard_mut().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .guard()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn stat(&self, path: &str) -> Result<Option<FileStat>, StorageError> {
        validate_file_path(path)?;
        Ok(self.guard().get(path).map(|(bytes, modified_at)| FileStat {
            size: bytes.len() as u64,
            modified_at: *modified_at,
        }))
    }
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Runs the shared contract suite against any backend.
    fn contract_suite(backend: &dyn StorageBackend) {
        // read on absent path is NotFound.
        assert!(matches!(
            backend.read("missing.json"),
            Err(StorageError::NotFound(_))
        ));

        // write then read round-trips.
        backend.write("ns/entities/a.json", b"{\"v\":1}").unwrap();
        assert_eq!(backend.read("ns/entities/a.json").unwrap(), b"{\"v\":1}");

        // write replaces.
        backend.write("ns/entities/a.json", b"{\"v\":2}").unwrap();
        assert_eq!(backend.read("ns/entities/a.json").unwrap(), b"{\"v\":2}");

        // exists.
        assert!(backend.exists("ns/entities/a.json").unwrap());
        assert!(!backend.exists("ns/entities/b.json").unwrap());

        // stat.
        let stat = backend.stat("ns/entities/a.json").unwrap().unwrap();
        assert_eq!(stat.size, 7);
        assert!(backend.stat("nope").unwrap().is_none());

        // list with prefix, sorted.
        backend.write("ns/entities/b.json", b"x").unwrap();
        backend.write("other/c.json", b"y").unwrap();
        assert_eq!(
            backend.list("ns/").unwrap(),
            vec!["ns/entities/a.json", "ns/entities/b.json"]
        );

        // delete is idempotent.
        backend.delete("ns/entities/a.json").unwrap();
        backend.delete("ns/entities/a.json").unwrap();
        assert!(!backend.exists("ns/entities/a.json").unwrap());
    }

    #[test]
    fn memory_backend_contract() {
        contract_suite(&MemoryBackend::new());
    }

    #[test]
    fn fs_backend_contract() {
        let dir = TempDir::new().unwrap();
        contract_suite(&FsBackend::open(dir.path()).unwrap());
    }

    #[test]
    fn fs_backend_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        assert!(matches!(
            backend.read("../outside"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            backend.write("/abs/path", b"x"),
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[test]
    fn fs_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FsBackend::open(dir.path()).unwrap();
            backend.write("a/b/c.bin", &[1, 2, 3]).unwrap();
        }
        let backend = FsBackend::open(dir.path()).unwrap();
        assert_eq!(backend.read("a/b/c.bin").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn fs_backend_list_hides_tmp_files() {
        let dir = TempDir::new().unwrap();
        let backend = FsBackend::open(dir.path()).unwrap();
        backend.write("seg/data.json", b"x").unwrap();
        std::fs::write(dir.path().join("seg/leftover.json.tmp"), b"junk").unwrap();
        assert_eq!(backend.list("seg/").unwrap(), vec!["seg/data.json"]);
    }
}
