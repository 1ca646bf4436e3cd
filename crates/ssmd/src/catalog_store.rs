//! Equivalence Catalog persistence: atomic `manga_equivalents.yml` writes
//! and reload-after-write (spec Section 4.2).
//!
//! Holds the single in-process copy of [`EquivalenceCatalog`] behind a
//! mutex. Every successful [`CatalogStore::update`] writes the new document
//! to a temp file in the same directory, renames it into place, then
//! re-reads it from disk and rebuilds the catalog from the re-read bytes —
//! never from the in-memory value — so a write that silently truncated or a
//! concurrent external edit is caught before it's trusted.

use ssm_core::{CanonicalGroup, EquivalenceCatalog, EquivalenceDocument, SceneTag, UpdateOutcome};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CatalogStoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("document failed validation: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CatalogStoreError>;

/// Outcome of a [`CatalogStore::update`] call, extending
/// [`UpdateOutcome`] with the two persistence failure modes spec Section
/// 4.2 reserves for the daemon-side writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedOutcome {
    Inner(UpdateOutcome),
    WriteFailed { reason: String },
    ReloadFailed { reason: String },
}

struct Loaded {
    catalog: EquivalenceCatalog,
}

pub struct CatalogStore {
    path: PathBuf,
    state: Mutex<Loaded>,
}

impl CatalogStore {
    /// Load `manga_equivalents.yml` from `path`. A missing file is treated
    /// as an empty catalog so first-run start-up doesn't require the
    /// operator to pre-create it.
    pub fn load(path: &Path, scene_tags: &[SceneTag]) -> Result<Self> {
        let document = read_document(path)?;
        let catalog = EquivalenceCatalog::build(document, scene_tags)
            .map_err(CatalogStoreError::Invalid)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(Loaded { catalog }),
        })
    }

    pub fn resolve(&self, title: &str, scene_tags: &[SceneTag]) -> Option<ssm_core::Resolution> {
        self.state.lock().unwrap().catalog.resolve(title, scene_tags)
    }

    /// `Update(canonicalCandidate, aliases) → Outcome`, persisting any
    /// resulting document change atomically before reporting success.
    pub fn update(
        &self,
        canonical_candidate: &str,
        aliases: &[String],
        scene_tags: &[SceneTag],
    ) -> PersistedOutcome {
        let mut guard = self.state.lock().unwrap();
        let (outcome, new_document) =
            guard.catalog.plan_update(canonical_candidate, aliases, scene_tags);

        let Some(new_document) = new_document else {
            return PersistedOutcome::Inner(outcome);
        };

        if let Err(e) = write_document_atomically(&self.path, &new_document) {
            warn!(path = %self.path.display(), error = %e, "failed to persist equivalence catalog");
            return PersistedOutcome::WriteFailed { reason: e.to_string() };
        }

        match read_document(&self.path) {
            Ok(reread) => match EquivalenceCatalog::build(reread, scene_tags) {
                Ok(rebuilt) => {
                    guard.catalog = rebuilt;
                    info!(path = %self.path.display(), ?outcome, "equivalence catalog updated");
                    PersistedOutcome::Inner(outcome)
                }
                Err(reason) => {
                    warn!(path = %self.path.display(), reason, "re-read catalog failed validation");
                    PersistedOutcome::ReloadFailed { reason }
                }
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to re-read equivalence catalog after write");
                PersistedOutcome::ReloadFailed { reason: e.to_string() }
            }
        }
    }

    #[cfg(test)]
    fn groups(&self) -> Vec<CanonicalGroup> {
        self.state.lock().unwrap().catalog.document().groups.clone()
    }
}

fn read_document(path: &Path) -> Result<EquivalenceDocument> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str(&contents)
            .map_err(|source| CatalogStoreError::Parse { path: path.to_path_buf(), source }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(EquivalenceDocument::default()),
        Err(source) => Err(CatalogStoreError::Read { path: path.to_path_buf(), source }),
    }
}

fn write_document_atomically(path: &Path, document: &EquivalenceDocument) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let yaml = serde_yaml::to_string(document)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write as _;
    tmp.write_all(yaml.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
