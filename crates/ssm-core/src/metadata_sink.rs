//! `details.json` / `cover.jpg` placement contract (supplementary; spec.md
//! Section 1 names this output without assigning it a THE CORE module).
//!
//! [`OverrideMetadataSink`] is the seam: the daemon wires a concrete
//! filesystem implementation ([`crate::metadata_sink`] only defines path
//! helpers; the atomic-write implementation lives in
//! `ssmd::metadata_placement`), but nothing in the orchestration pipeline
//! calls it directly. The HTTP fetch and JSON construction that would
//! populate these files are external collaborators, out of scope here.

use crate::pathsafe::join_escaped;
use std::path::{Path, PathBuf};

/// Where a canonical title's ancillary metadata lives under the preferred
/// override root.
pub fn details_json_path(preferred_override_root: &Path, canonical_title: &str) -> PathBuf {
    join_escaped(preferred_override_root, canonical_title).join("details.json")
}

pub fn cover_jpg_path(preferred_override_root: &Path, canonical_title: &str) -> PathBuf {
    join_escaped(preferred_override_root, canonical_title).join("cover.jpg")
}

/// Placement contract for writing ancillary per-title metadata into the
/// preferred override directory. Implementations must write atomically
/// (temp file + rename) so a concurrent reader never observes a partial
/// file.
pub trait OverrideMetadataSink {
    fn write_details_json(&self, canonical_title: &str, contents: &[u8]) -> std::io::Result<()>;
    fn write_cover_jpg(&self, canonical_title: &str, contents: &[u8]) -> std::io::Result<()>;
}
