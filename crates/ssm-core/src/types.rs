//! Core types for the manga union-mount daemon.
//!
//! These types match the data model defined in Section 3: the entities not
//! already owned by a dedicated module ([`crate::planner`] owns
//! `BranchLink`/`MergerfsBranchPlan`, [`crate::mount`] owns
//! `MountSnapshotEntry`/`MountReconciliationAction`,
//! [`crate::metadata_state`] owns `MetadataStateSnapshot`,
//! [`crate::equivalence`] owns `CanonicalGroup`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A read-only disk-resident collection of sources, discovered as a
/// depth-1 child of the sources root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceVolume {
    pub root: PathBuf,
    pub name: String,
}

/// One source directory (`<volume>/<source>`) under a [`SourceVolume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBranchRoot {
    pub volume: String,
    pub source_name: String,
    pub root: PathBuf,
}

/// A raw title directory discovered under a source or override root,
/// before grouping. The comparison key is computed once via
/// [`crate::normalize`] and cached by the caller keyed on `raw_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleDirectory {
    pub source_name: String,
    pub raw_name: String,
    pub path: PathBuf,
    pub comparison_key: String,
}

/// An entry in the debounced chapter Rename Queue (Section 4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameQueueEntry {
    pub chapter_path: PathBuf,
    pub earliest_action: DateTime<Utc>,
}

impl RenameQueueEntry {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.earliest_action
    }
}

/// Classification of a filesystem event relative to the sources root
/// (Section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    NewSource,
    NewManga,
    NewChapter,
    OverrideChange,
    Noise,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewSource => "new_source",
            Self::NewManga => "new_manga",
            Self::NewChapter => "new_chapter",
            Self::OverrideChange => "override_change",
            Self::Noise => "noise",
        }
    }

    /// Classify an event by its depth below the sources root, or `None`
    /// when the path isn't under the sources root at all (caller checks
    /// the override root separately).
    pub fn from_sources_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(Self::NewSource),
            2 => Some(Self::NewManga),
            3 => Some(Self::NewChapter),
            _ => None,
        }
    }
}

/// One raw `inotifywait` event line, parsed and path-normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub event_kinds: Vec<String>,
}
