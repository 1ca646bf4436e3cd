//! Branch Planner (spec Section 4.3).
//!
//! Pure function: given a canonical title, the configured override
//! volumes, and the caller-ordered source branches for a group, produce a
//! deterministic [`MergerfsBranchPlan`]. The only filesystem interaction is
//! the "does this non-preferred override path already exist" check, which
//! is injected via [`DirExists`] so the planner stays unit-testable without
//! touching disk.

use crate::pathsafe::{compare_paths, join_escaped, sanitize_link_name};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const RESERVED_PREFERRED_VOLUME_NAME: &str = "priority";

/// Access mode for a branch contributed to the mergerfs union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessMode {
    Rw,
    Ro,
}

impl AccessMode {
    pub fn as_spec_token(self) -> &'static str {
        match self {
            Self::Rw => "RW",
            Self::Ro => "RO",
        }
    }
}

/// A single override volume as discovered at the filesystem root.
#[derive(Debug, Clone)]
pub struct OverrideVolume {
    pub root: PathBuf,
    pub name: String,
}

impl OverrideVolume {
    pub fn is_preferred_candidate(&self) -> bool {
        self.name.eq_ignore_ascii_case(RESERVED_PREFERRED_VOLUME_NAME)
    }
}

/// A discovered source branch contributed to a group, in caller-supplied
/// order (source-priority file, then name).
#[derive(Debug, Clone)]
pub struct SourceBranch {
    pub path: PathBuf,
    pub source_name: String,
}

/// A materialized branch-link entry within a group's staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLink {
    pub link_name: String,
    pub link_path: PathBuf,
    pub target_path: PathBuf,
    pub mode: AccessMode,
}

/// The Branch Planner's output for one canonical group.
#[derive(Debug, Clone)]
pub struct MergerfsBranchPlan {
    pub preferred_override_path: PathBuf,
    pub staging_dir: PathBuf,
    pub branch_spec: String,
    pub desired_identity: String,
    pub group_id: String,
    pub branch_links: Vec<BranchLink>,
}

/// Injected filesystem predicate: does `path` already exist on disk?
/// Production code wires this to `Path::exists`; tests can fake it.
pub trait DirExists {
    fn exists(&self, path: &Path) -> bool;
}

/// Production implementation backed by the real filesystem.
pub struct RealDirExists;

impl DirExists for RealDirExists {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// 16-hex-char SHA-256 prefix of `group_key`.
pub fn group_id(group_key: &str) -> String {
    hex_prefix(group_key.as_bytes(), 16)
}

/// 12-hex-char SHA-256 prefix of `branch_spec`.
fn branch_spec_hash(branch_spec: &str) -> String {
    hex_prefix(branch_spec.as_bytes(), 12)
}

fn hex_prefix(data: &[u8], hex_chars: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let full_hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    full_hex[..hex_chars.min(full_hex.len())].to_string()
}

/// Pick the preferred override volume: the one named `priority`
/// (case-insensitive) if present, else the OS-order-first volume.
pub fn pick_preferred<'a>(volumes: &'a [OverrideVolume]) -> Option<&'a OverrideVolume> {
    if let Some(named) = volumes.iter().find(|v| v.is_preferred_candidate()) {
        return Some(named);
    }
    volumes
        .iter()
        .min_by(|a, b| compare_paths(&a.root.to_string_lossy(), &b.root.to_string_lossy()))
}

/// Build the deterministic ordered list of branch links for a group and
/// the desired identity token, per spec Section 4.3 / Section 3.
///
/// `canonical_title` is the display title (mountpoint basename).
/// `non_preferred_overrides` must already be filtered to volumes whose
/// per-title path exists on disk (the `DirExists` check happens in
/// [`plan_group`]; this function stays pure over pre-resolved paths).
pub fn build_plan(
    group_key: &str,
    canonical_title: &str,
    branch_links_root: &Path,
    preferred_override: &OverrideVolume,
    non_preferred_override_paths: &[(String, PathBuf)],
    source_branches: &[SourceBranch],
) -> MergerfsBranchPlan {
    let gid = group_id(group_key);
    let staging_dir = branch_links_root.join(&gid);
    let preferred_path = join_escaped(&preferred_override.root, canonical_title);

    let mut links = Vec::new();

    links.push(make_link(
        &staging_dir,
        "00_override_primary".to_string(),
        preferred_path.clone(),
        AccessMode::Rw,
    ));

    // Non-preferred overrides: OS-aware comparer on volume name.
    let mut sorted_overrides: Vec<&(String, PathBuf)> = non_preferred_override_paths.iter().collect();
    sorted_overrides.sort_by(|a, b| compare_paths(&a.0, &b.0));
    for (idx, (vol_name, path)) in sorted_overrides.iter().enumerate() {
        let link_name = format!("01_override_{}_{:03}", sanitize_link_name(vol_name), idx);
        links.push(make_link(&staging_dir, link_name, (*path).clone(), AccessMode::Rw));
    }

    // Sources: preserve caller-supplied order.
    for (idx, branch) in source_branches.iter().enumerate() {
        let link_name = format!(
            "10_source_{}_{:03}",
            sanitize_link_name(&branch.source_name),
            idx
        );
        links.push(make_link(
            &staging_dir,
            link_name,
            branch.path.clone(),
            AccessMode::Ro,
        ));
    }

    let branch_spec = links
        .iter()
        .map(|l| format!("{}={}", l.link_path.display(), l.mode.as_spec_token()))
        .collect::<Vec<_>>()
        .join(":");

    let desired_identity = format!("suwayomi_{}_{}", gid, branch_spec_hash(&branch_spec));

    MergerfsBranchPlan {
        preferred_override_path: preferred_path,
        staging_dir,
        branch_spec,
        desired_identity,
        group_id: gid,
        branch_links: links,
    }
}

fn make_link(staging_dir: &Path, link_name: String, target: PathBuf, mode: AccessMode) -> BranchLink {
    let link_path = staging_dir.join(&link_name);
    BranchLink {
        link_name,
        link_path,
        target_path: target,
        mode,
    }
}

/// Full Branch Planner entry point: resolves which non-preferred override
/// volumes actually have a per-title directory on disk, then delegates to
/// [`build_plan`].
pub fn plan_group(
    group_key: &str,
    canonical_title: &str,
    branch_links_root: &Path,
    override_volumes: &[OverrideVolume],
    source_branches: &[SourceBranch],
    dir_exists: &dyn DirExists,
) -> Option<MergerfsBranchPlan> {
    let preferred = pick_preferred(override_volumes)?;

    let non_preferred: Vec<(String, PathBuf)> = override_volumes
        .iter()
        .filter(|v| !std::ptr::eq(*v, preferred))
        .filter_map(|v| {
            let candidate = join_escaped(&v.root, canonical_title);
            dir_exists.exists(&candidate).then_some((v.name.clone(), candidate))
        })
        .collect();

    Some(build_plan(
        group_key,
        canonical_title,
        branch_links_root,
        preferred,
        &non_preferred,
        source_branches,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeDirExists(HashSet<PathBuf>);

    impl DirExists for FakeDirExists {
        fn exists(&self, path: &Path) -> bool {
            self.0.contains(path)
        }
    }

    #[test]
    fn link_names_sort_in_spec_order() {
        let staging = PathBuf::from("/ssm/state/branch-links/abc");
        let preferred = OverrideVolume {
            root: PathBuf::from("/ssm/override/priority"),
            name: "priority".to_string(),
        };
        let non_preferred = vec![("vol2".to_string(), PathBuf::from("/ssm/override/vol2/Title"))];
        let sources = vec![
            SourceBranch {
                path: PathBuf::from("/ssm/sources/disk1/Source1/Title"),
                source_name: "Source1".to_string(),
            },
        ];
        let plan = build_plan("titlekey", "Title", &staging, &preferred, &non_preferred, &sources);
        let names: Vec<&str> = plan.branch_links.iter().map(|l| l.link_name.as_str()).collect();
        assert_eq!(names[0], "00_override_primary");
        assert!(names[1].starts_with("01_override_"));
        assert!(names[2].starts_with("10_source_"));

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "link names must already sort in the desired order");
    }

    #[test]
    fn desired_identity_is_pure_function_of_group_key_and_branch_spec() {
        let staging = PathBuf::from("/ssm/state/branch-links");
        let preferred = OverrideVolume {
            root: PathBuf::from("/ssm/override/priority"),
            name: "priority".to_string(),
        };
        let sources = vec![SourceBranch {
            path: PathBuf::from("/ssm/sources/disk1/Source1/Title"),
            source_name: "Source1".to_string(),
        }];
        let plan1 = build_plan("key", "Title", &staging, &preferred, &[], &sources);
        let plan2 = build_plan("key", "Title", &staging, &preferred, &[], &sources);
        assert_eq!(plan1.desired_identity, plan2.desired_identity);

        let plan3 = build_plan("key", "Title", &staging, &preferred, &[], &[]);
        assert_ne!(plan1.desired_identity, plan3.desired_identity);
    }

    #[test]
    fn preferred_override_picks_reserved_token_case_insensitive() {
        let volumes = vec![
            OverrideVolume { root: PathBuf::from("/ov/zzz"), name: "zzz".to_string() },
            OverrideVolume { root: PathBuf::from("/ov/Priority"), name: "Priority".to_string() },
        ];
        let picked = pick_preferred(&volumes).unwrap();
        assert_eq!(picked.name, "Priority");
    }

    #[test]
    fn preferred_override_falls_back_to_os_order_first() {
        let volumes = vec![
            OverrideVolume { root: PathBuf::from("/ov/zzz"), name: "zzz".to_string() },
            OverrideVolume { root: PathBuf::from("/ov/aaa"), name: "aaa".to_string() },
        ];
        let picked = pick_preferred(&volumes).unwrap();
        assert_eq!(picked.name, "aaa");
    }

    #[test]
    fn non_preferred_override_only_included_if_exists_on_disk() {
        let staging = PathBuf::from("/ssm/state/branch-links");
        let vol_exists = PathBuf::from("/ov/vol2/Title");
        let mut existing = HashSet::new();
        existing.insert(vol_exists.clone());
        let dir_exists = FakeDirExists(existing);

        let volumes = vec![
            OverrideVolume { root: PathBuf::from("/ov/priority"), name: "priority".to_string() },
            OverrideVolume { root: PathBuf::from("/ov/vol2"), name: "vol2".to_string() },
            OverrideVolume { root: PathBuf::from("/ov/vol3"), name: "vol3".to_string() },
        ];

        let plan = plan_group("key", "Title", &staging, &volumes, &[], &dir_exists).unwrap();
        let non_preferred_count = plan
            .branch_links
            .iter()
            .filter(|l| l.link_name.starts_with("01_override_"))
            .count();
        assert_eq!(non_preferred_count, 1);
    }

    #[test]
    fn branch_spec_is_colon_joined_path_equals_mode() {
        let staging = PathBuf::from("/ssm/state/branch-links/g");
        let preferred = OverrideVolume {
            root: PathBuf::from("/ov/priority"),
            name: "priority".to_string(),
        };
        let sources = vec![SourceBranch {
            path: PathBuf::from("/src/disk1/Source1/Title"),
            source_name: "Source1".to_string(),
        }];
        let plan = build_plan("key", "Title", &staging, &preferred, &[], &sources);
        assert!(plan.branch_spec.contains("=RW:"));
        assert!(plan.branch_spec.ends_with("=RO"));
    }
}
