//! Branch-Link Stager: idempotently materializes the symlinks a
//! [`MergerfsBranchPlan`] describes under its staging directory, and
//! removes stray entries left behind by a prior plan (spec Section 2
//! item 6).

use ssm_core::MergerfsBranchPlan;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StagerError {
    #[error("failed to create staging directory {path}: {source}")]
    CreateDir {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create symlink {link} -> {target}: {source}")]
    Symlink {
        link: std::path::PathBuf,
        target: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StagerError>;

/// Materialize every [`BranchLink`](ssm_core::BranchLink) in `plan` and
/// remove any directory entry under the staging directory that the plan no
/// longer names. Safe to call repeatedly: existing correct links are left
/// untouched, stale or mismatched entries are replaced.
pub fn stage(plan: &MergerfsBranchPlan) -> Result<()> {
    std::fs::create_dir_all(&plan.staging_dir).map_err(|source| StagerError::CreateDir {
        path: plan.staging_dir.clone(),
        source,
    })?;

    let wanted: std::collections::HashSet<&str> =
        plan.branch_links.iter().map(|l| l.link_name.as_str()).collect();

    remove_stray_entries(&plan.staging_dir, &wanted);

    for link in &plan.branch_links {
        ensure_symlink(&link.link_path, &link.target_path)?;
    }

    Ok(())
}

fn remove_stray_entries(staging_dir: &Path, wanted: &std::collections::HashSet<&str>) {
    let Ok(entries) = std::fs::read_dir(staging_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if wanted.contains(name) {
            continue;
        }
        let path = entry.path();
        debug!(path = %path.display(), "removing stray branch link");
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove stray branch-link entry");
        }
    }
}

/// Create `link -> target`, replacing an existing entry only if it points
/// somewhere else.
fn ensure_symlink(link: &Path, target: &Path) -> Result<()> {
    match std::fs::read_link(link) {
        Ok(existing) if existing == target => return Ok(()),
        Ok(_) => {
            std::fs::remove_file(link).map_err(|source| StagerError::Symlink {
                link: link.to_path_buf(),
                target: target.to_path_buf(),
                source,
            })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(_) => {
            // Not a symlink (e.g. a plain file left behind); replace it.
            let _ = std::fs::remove_file(link);
        }
    }

    symlink(target, link).map_err(|source| StagerError::Symlink {
        link: link.to_path_buf(),
        target: target.to_path_buf(),
        source,
    })
}

/// Remove an entire group's staging directory, e.g. when the group no
/// longer exists after a scan.
pub fn remove_group_dir(staging_dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(staging_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
