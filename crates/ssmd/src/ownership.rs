//! PUID/PGID-aware file ownership (supplementary; spec.md Section 6
//! "Environment"). Applied to newly created branch-link staging
//! directories and newly written state files so they're owned by the
//! configured non-root user inside the container, matching the
//! LinuxServer.io-style `PUID`/`PGID` convention.

use nix::unistd::{Gid, Uid};
use std::path::Path;
use tracing::warn;

pub const DEFAULT_PUID: u32 = 99;
pub const DEFAULT_PGID: u32 = 100;

/// `chown(path, puid, pgid)`, logging and continuing on failure rather
/// than propagating — ownership is best-effort and must never block the
/// mount reconciliation loop.
pub fn chown_path(path: &Path, puid: u32, pgid: u32) {
    if let Err(e) = nix::unistd::chown(path, Some(Uid::from_raw(puid)), Some(Gid::from_raw(pgid))) {
        warn!(path = %path.display(), puid, pgid, error = %e, "failed to chown path");
    }
}

/// Recursively `chown`s everything under `root`, including `root` itself.
pub fn chown_tree(root: &Path, puid: u32, pgid: u32) {
    chown_path(root, puid, pgid);
    for entry in walkdir::WalkDir::new(root).min_depth(1).into_iter().filter_map(Result::ok) {
        chown_path(entry.path(), puid, pgid);
    }
}
