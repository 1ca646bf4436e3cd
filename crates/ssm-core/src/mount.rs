//! Mount Reconciler: pure desired-state-vs-observed-state diff (spec
//! Section 4.4).

use crate::pathsafe::{compare_paths, is_at_or_below, paths_equal};
use std::collections::HashSet;

/// One entry the Scan Orchestrator wants mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredMount {
    pub mountpoint: String,
    pub desired_identity: String,
    pub branch_spec: String,
    /// `None` when health checks are disabled; `Some(false)` marks an
    /// explicitly unhealthy mount.
    pub healthy: Option<bool>,
}

/// One line parsed from a `findmnt -P` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSnapshotEntry {
    pub mountpoint: String,
    pub fstype: String,
    /// The mount's `source` field, or its `fsname=` option value if the
    /// source field itself doesn't carry the identity token.
    pub identity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Mount,
    Remount,
    Unmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReason {
    ForcedRemount,
    MissingMount,
    NonMergerfsAtTarget,
    DesiredIdentityMismatch,
    UnhealthyMount,
    StaleMount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountAction {
    pub kind: ActionKind,
    pub mountpoint: String,
    pub reason: ActionReason,
    /// Populated for `Mount`/`Remount`; `None` for `Unmount`.
    pub desired_identity: Option<String>,
    pub branch_spec: Option<String>,
}

/// Reconcile desired mounts against an observed snapshot, per spec Section
/// 4.4's six-step decision and trailing stale-mount sweep.
///
/// `managed_roots` bounds the stale-mount sweep to mounts this system
/// owns; `forced_remount` names mountpoints the caller wants remounted
/// regardless of identity match (e.g. after an override-root event).
pub fn reconcile(
    desired: &[DesiredMount],
    observed: &[MountSnapshotEntry],
    forced_remount: &HashSet<String>,
    managed_roots: &[String],
    health_checks_enabled: bool,
) -> Vec<MountAction> {
    let mut ordered_desired: Vec<&DesiredMount> = desired.iter().collect();
    ordered_desired.sort_by(|a, b| compare_paths(&a.mountpoint, &b.mountpoint));

    let mut actions = Vec::new();
    let mut desired_mountpoints: HashSet<String> = HashSet::new();

    for d in &ordered_desired {
        desired_mountpoints.insert(d.mountpoint.clone());
        let observed_entry = observed.iter().find(|o| paths_equal(&o.mountpoint, &d.mountpoint));

        let action = if forced_remount.iter().any(|m| paths_equal(m, &d.mountpoint)) {
            Some((ActionKind::Remount, ActionReason::ForcedRemount))
        } else if observed_entry.is_none() {
            Some((ActionKind::Mount, ActionReason::MissingMount))
        } else if !observed_entry.unwrap().fstype.contains("mergerfs") {
            Some((ActionKind::Remount, ActionReason::NonMergerfsAtTarget))
        } else if observed_entry.unwrap().identity != d.desired_identity {
            Some((ActionKind::Remount, ActionReason::DesiredIdentityMismatch))
        } else if health_checks_enabled && d.healthy == Some(false) {
            Some((ActionKind::Remount, ActionReason::UnhealthyMount))
        } else {
            None
        };

        if let Some((kind, reason)) = action {
            actions.push(MountAction {
                kind,
                mountpoint: d.mountpoint.clone(),
                reason,
                desired_identity: Some(d.desired_identity.clone()),
                branch_spec: Some(d.branch_spec.clone()),
            });
        }
    }

    let mut stale: Vec<&MountSnapshotEntry> = observed
        .iter()
        .filter(|o| o.fstype.contains("mergerfs"))
        .filter(|o| managed_roots.iter().any(|root| is_at_or_below(root, &o.mountpoint)))
        .filter(|o| !desired_mountpoints.iter().any(|d| paths_equal(d, &o.mountpoint)))
        .collect();

    // Deepest-first; same-depth ties broken by descending path, e.g.
    // `/merged/A`, `/merged/A/B`, `/merged/C` unmounts as [A/B, C, A].
    stale.sort_by(|a, b| {
        let depth_a = a.mountpoint.matches('/').count();
        let depth_b = b.mountpoint.matches('/').count();
        depth_b
            .cmp(&depth_a)
            .then_with(|| compare_paths(&b.mountpoint, &a.mountpoint))
    });

    for entry in stale {
        actions.push(MountAction {
            kind: ActionKind::Unmount,
            mountpoint: entry.mountpoint.clone(),
            reason: ActionReason::StaleMount,
            desired_identity: None,
            branch_spec: None,
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(mountpoint: &str, identity: &str) -> DesiredMount {
        DesiredMount {
            mountpoint: mountpoint.to_string(),
            desired_identity: identity.to_string(),
            branch_spec: "spec".to_string(),
            healthy: None,
        }
    }

    #[test]
    fn missing_mount_is_mounted() {
        let d = vec![desired("/ssm/merged/Title", "id1")];
        let actions = reconcile(&d, &[], &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Mount);
        assert_eq!(actions[0].reason, ActionReason::MissingMount);
    }

    #[test]
    fn matching_identity_is_no_action() {
        let d = vec![desired("/ssm/merged/Title", "id1")];
        let observed = vec![MountSnapshotEntry {
            mountpoint: "/ssm/merged/Title".to_string(),
            fstype: "fuse.mergerfs".to_string(),
            identity: "id1".to_string(),
        }];
        let actions = reconcile(&d, &observed, &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert!(actions.is_empty());
    }

    #[test]
    fn identity_mismatch_triggers_remount() {
        let d = vec![desired("/ssm/merged/Title", "id2")];
        let observed = vec![MountSnapshotEntry {
            mountpoint: "/ssm/merged/Title".to_string(),
            fstype: "fuse.mergerfs".to_string(),
            identity: "id1".to_string(),
        }];
        let actions = reconcile(&d, &observed, &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert_eq!(actions[0].kind, ActionKind::Remount);
        assert_eq!(actions[0].reason, ActionReason::DesiredIdentityMismatch);
    }

    #[test]
    fn non_mergerfs_at_target_triggers_remount() {
        let d = vec![desired("/ssm/merged/Title", "id1")];
        let observed = vec![MountSnapshotEntry {
            mountpoint: "/ssm/merged/Title".to_string(),
            fstype: "tmpfs".to_string(),
            identity: "id1".to_string(),
        }];
        let actions = reconcile(&d, &observed, &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert_eq!(actions[0].reason, ActionReason::NonMergerfsAtTarget);
    }

    #[test]
    fn forced_remount_wins_over_matching_identity() {
        let d = vec![desired("/ssm/merged/Title", "id1")];
        let observed = vec![MountSnapshotEntry {
            mountpoint: "/ssm/merged/Title".to_string(),
            fstype: "fuse.mergerfs".to_string(),
            identity: "id1".to_string(),
        }];
        let mut forced = HashSet::new();
        forced.insert("/ssm/merged/Title".to_string());
        let actions = reconcile(&d, &observed, &forced, &["/ssm/merged".to_string()], false);
        assert_eq!(actions[0].reason, ActionReason::ForcedRemount);
    }

    #[test]
    fn unhealthy_mount_remounts_only_when_checks_enabled() {
        let mut d = desired("/ssm/merged/Title", "id1");
        d.healthy = Some(false);
        let observed = vec![MountSnapshotEntry {
            mountpoint: "/ssm/merged/Title".to_string(),
            fstype: "fuse.mergerfs".to_string(),
            identity: "id1".to_string(),
        }];
        let disabled = reconcile(&[d.clone()], &observed, &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert!(disabled.is_empty());

        let enabled = reconcile(&[d], &observed, &HashSet::new(), &["/ssm/merged".to_string()], true);
        assert_eq!(enabled[0].reason, ActionReason::UnhealthyMount);
    }

    #[test]
    fn stale_mounts_unmount_deepest_first() {
        let observed = vec![
            MountSnapshotEntry {
                mountpoint: "/ssm/merged/A".to_string(),
                fstype: "fuse.mergerfs".to_string(),
                identity: "stale".to_string(),
            },
            MountSnapshotEntry {
                mountpoint: "/ssm/merged/A/nested/deep".to_string(),
                fstype: "fuse.mergerfs".to_string(),
                identity: "stale".to_string(),
            },
        ];
        let actions = reconcile(&[], &observed, &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].mountpoint, "/ssm/merged/A/nested/deep");
        assert_eq!(actions[1].mountpoint, "/ssm/merged/A");
    }

    #[test]
    fn stale_mounts_same_depth_tie_break_matches_worked_example() {
        let observed = vec![
            MountSnapshotEntry {
                mountpoint: "/merged/A".to_string(),
                fstype: "fuse.mergerfs".to_string(),
                identity: "stale".to_string(),
            },
            MountSnapshotEntry {
                mountpoint: "/merged/A/B".to_string(),
                fstype: "fuse.mergerfs".to_string(),
                identity: "stale".to_string(),
            },
            MountSnapshotEntry {
                mountpoint: "/merged/C".to_string(),
                fstype: "fuse.mergerfs".to_string(),
                identity: "stale".to_string(),
            },
        ];
        let actions = reconcile(&[], &observed, &HashSet::new(), &["/merged".to_string()], false);
        let mountpoints: Vec<&str> = actions.iter().map(|a| a.mountpoint.as_str()).collect();
        assert_eq!(mountpoints, vec!["/merged/A/B", "/merged/C", "/merged/A"]);
    }

    #[test]
    fn unmanaged_root_mounts_are_never_touched() {
        let observed = vec![MountSnapshotEntry {
            mountpoint: "/other/mount".to_string(),
            fstype: "fuse.mergerfs".to_string(),
            identity: "whatever".to_string(),
        }];
        let actions = reconcile(&[], &observed, &HashSet::new(), &["/ssm/merged".to_string()], false);
        assert!(actions.is_empty());
    }
}
