pub mod config;
pub mod equivalence;
pub mod metadata_sink;
pub mod metadata_state;
pub mod mount;
pub mod normalize;
pub mod pathsafe;
pub mod planner;
pub mod types;

pub use config::{Settings, SceneTagsDocument, SourcePriorityDocument};
pub use equivalence::{CanonicalGroup, EquivalenceCatalog, EquivalenceDocument, Resolution, UpdateOutcome};
pub use metadata_sink::OverrideMetadataSink;
pub use metadata_state::{MetadataStateSnapshot, QuarantineReason};
pub use mount::{ActionKind, ActionReason, DesiredMount, MountAction, MountSnapshotEntry};
pub use normalize::{SceneTag, TitleNormalizer};
pub use planner::{AccessMode, BranchLink, MergerfsBranchPlan, OverrideVolume, SourceBranch};
pub use types::{EventClass, RenameQueueEntry, SourceVolume, TitleDirectory, WatchEvent};
