//! Metadata State Store I/O: atomic JSON snapshot persistence and
//! corruption quarantine around [`ssm_core::metadata_state`]'s pure
//! parse/serialize logic (spec Section 3, Section 6, Section 7).

use ssm_core::metadata_state::{parse_snapshot, serialize_snapshot, QuarantineReason};
use ssm_core::MetadataStateSnapshot;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MetadataStoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MetadataStoreError>;

pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<MetadataStateSnapshot>,
}

impl MetadataStore {
    /// Load `metadata_state.json`, quarantining and resetting to an empty
    /// snapshot if the file is malformed, has an unsupported schema
    /// version, or is unexpectedly a directory.
    pub fn load(path: &Path) -> Result<Self> {
        if path.is_dir() {
            quarantine_directory(path)?;
            return Ok(Self { path: path.to_path_buf(), state: Mutex::new(MetadataStateSnapshot::default()) });
        }

        let snapshot = match std::fs::read(path) {
            Ok(bytes) => match parse_snapshot(&bytes) {
                Ok(snapshot) => snapshot,
                Err(reason) => {
                    quarantine_file(path, &reason)?;
                    MetadataStateSnapshot::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => MetadataStateSnapshot::default(),
            Err(source) => return Err(MetadataStoreError::Read { path: path.to_path_buf(), source }),
        };

        Ok(Self { path: path.to_path_buf(), state: Mutex::new(snapshot) })
    }

    /// `Read()`: a consistent snapshot of current state.
    pub fn read(&self) -> MetadataStateSnapshot {
        self.state.lock().unwrap().clone()
    }

    /// `Transform(fn)`: apply `f` to the current snapshot under the lock,
    /// persist the result atomically, and only commit it in memory once
    /// the write succeeds.
    pub fn transform<F>(&self, f: F) -> Result<MetadataStateSnapshot>
    where
        F: FnOnce(&mut MetadataStateSnapshot),
    {
        let mut guard = self.state.lock().unwrap();
        let mut candidate = guard.clone();
        f(&mut candidate);
        write_atomically(&self.path, &candidate)?;
        *guard = candidate.clone();
        Ok(candidate)
    }
}

fn write_atomically(path: &Path, snapshot: &MetadataStateSnapshot) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| MetadataStoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let bytes = serialize_snapshot(snapshot).expect("metadata snapshot always serializes");

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|source| MetadataStoreError::Write { path: path.to_path_buf(), source })?;
    use std::io::Write as _;
    tmp.write_all(&bytes)
        .map_err(|source| MetadataStoreError::Write { path: path.to_path_buf(), source })?;
    tmp.flush()
        .map_err(|source| MetadataStoreError::Write { path: path.to_path_buf(), source })?;
    tmp.persist(path)
        .map_err(|e| MetadataStoreError::Write { path: path.to_path_buf(), source: e.error })?;
    Ok(())
}

/// Copy the malformed file aside as `<name>.corrupt`, replacing any prior
/// backup, then leave the original path clear for a fresh default snapshot.
fn quarantine_file(path: &Path, reason: &QuarantineReason) -> Result<()> {
    let backup = corrupt_backup_path(path);
    warn!(path = %path.display(), backup = %backup.display(), %reason, "quarantining corrupt metadata state file");
    std::fs::copy(path, &backup).map_err(|source| MetadataStoreError::Write {
        path: backup.clone(),
        source,
    })?;
    std::fs::remove_file(path).map_err(|source| MetadataStoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// A directory unexpectedly occupying the state file's path is moved aside
/// to `<name>.corrupt.d` rather than deleted outright.
fn quarantine_directory(path: &Path) -> Result<()> {
    let backup = append_suffix(path, "corrupt.d");
    warn!(path = %path.display(), backup = %backup.display(), "quarantining directory found at metadata state path");
    std::fs::rename(path, &backup).map_err(|source| MetadataStoreError::Write {
        path: backup,
        source,
    })
}

/// `<name>.corrupt`; a fixed name, not a timestamped one, so a later
/// quarantine replaces the previous backup instead of accumulating.
fn corrupt_backup_path(path: &Path) -> PathBuf {
    append_suffix(path, "corrupt")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("metadata_state.json");
    path.with_file_name(format!("{file_name}.{suffix}"))
}
