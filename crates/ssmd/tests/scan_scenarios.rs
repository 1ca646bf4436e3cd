//! End-to-end Scan Orchestrator scenarios against a real temp-dir
//! filesystem layout, with the Mount Command Service and mount snapshot
//! faked out so no real mergerfs/findmnt binaries are required.

use ssm_core::planner::MergerfsBranchPlan;
use ssm_core::{MountAction, MountSnapshotEntry, SceneTagsDocument, Settings, SourcePriorityDocument};
use ssmd::catalog_store::CatalogStore;
use ssmd::coalescer::ScanReason;
use ssmd::mount_service::{CommandOutcome, MountApplier, SnapshotProvider};
use ssmd::scan::ScanOrchestrator;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// In-memory stand-in for the real mount table: [`FakeApplier`] updates it
/// on every successful action, [`FakeApplier`] itself doubles as the
/// [`SnapshotProvider`] so a scan's own actions are visible to its next
/// reconcile step (mirroring how `findmnt` reflects a prior `mergerfs`
/// invocation in production).
#[derive(Default)]
struct FakeApplier {
    mounts: Mutex<Vec<MountSnapshotEntry>>,
    applied: Mutex<Vec<MountAction>>,
}

#[async_trait::async_trait]
impl MountApplier for FakeApplier {
    async fn apply(
        &self,
        action: &MountAction,
        _plan: Option<&MergerfsBranchPlan>,
        _mergerfs_base_options: &str,
        _snapshot_provider: &dyn SnapshotProvider,
    ) -> CommandOutcome {
        self.applied.lock().unwrap().push(action.clone());
        let mut mounts = self.mounts.lock().unwrap();
        mounts.retain(|m| m.mountpoint != action.mountpoint);
        if !matches!(action.kind, ssm_core::ActionKind::Unmount) {
            mounts.push(MountSnapshotEntry {
                mountpoint: action.mountpoint.clone(),
                fstype: "fuse.mergerfs".to_string(),
                identity: action.desired_identity.clone().unwrap_or_default(),
            });
        }
        CommandOutcome::Succeeded
    }
}

#[async_trait::async_trait]
impl SnapshotProvider for FakeApplier {
    async fn snapshot(&self) -> std::io::Result<Vec<MountSnapshotEntry>> {
        Ok(self.mounts.lock().unwrap().clone())
    }
}

struct Harness {
    root: tempfile::TempDir,
    settings: Settings,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let settings = Settings {
            sources_root: root.path().join("sources"),
            override_root: root.path().join("override"),
            merged_root: root.path().join("merged"),
            state_dir: root.path().join("state"),
            config_dir: root.path().join("config"),
            ..Settings::default()
        };
        for dir in [&settings.sources_root, &settings.override_root, &settings.merged_root, &settings.state_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::create_dir_all(settings.override_root.join("priority")).unwrap();
        Self { root, settings }
    }

    fn override_title(&self, volume: &str, title: &str) {
        std::fs::create_dir_all(self.settings.override_root.join(volume).join(title)).unwrap();
    }

    async fn orchestrator(&self, catalog_yaml: &str) -> ScanOrchestrator {
        std::fs::create_dir_all(&self.settings.config_dir).unwrap();
        let catalog_path = self.settings.config_dir.join("manga_equivalents.yml");
        std::fs::write(&catalog_path, catalog_yaml).unwrap();
        let catalog = CatalogStore::load(&catalog_path, &[]).unwrap();
        let source_priority = SourcePriorityDocument { sources: vec!["Source1".into(), "Source2".into(), "Source3".into()] };
        let scene_tags = SceneTagsDocument { tags: vec!["official".to_string()] }.to_scene_tags();
        ScanOrchestrator::new(
            self.settings.clone(),
            catalog,
            source_priority,
            scene_tags,
            Box::new(FakeApplier::default()),
            Box::new(FakeApplier::default()),
        )
    }
}

fn dir_names(path: &Path) -> Vec<String> {
    std::fs::read_dir(path)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

#[tokio::test]
async fn first_start_up_with_three_sources_merges_into_one_mountpoint() {
    let h = Harness::new();
    std::fs::create_dir_all(h.settings.sources_root.join("Source1").join("Manga Title 1")).unwrap();
    std::fs::create_dir_all(h.settings.sources_root.join("Source2").join("manga title 1")).unwrap();
    std::fs::create_dir_all(h.settings.sources_root.join("Source3").join("MANGA TITLE 1!!")).unwrap();

    let orchestrator = h
        .orchestrator("groups:\n  - canonical: \"Manga Title 1\"\n    aliases: [\"Manga Title 1\"]\n")
        .await;

    let summary = orchestrator.run_once(ScanReason::Manual, &HashSet::new()).await;
    assert_eq!(summary.groups, 1);
    assert_eq!(summary.sources, 3);

    let mountpoints = dir_names(&h.settings.merged_root.parent().unwrap_or(&h.settings.merged_root));
    let _ = mountpoints; // merged_root itself is never materialized by the fake applier; assert via actions instead
    assert_eq!(summary.actions, 1, "exactly one mount action for the single canonical group");
}

#[tokio::test]
async fn scene_tag_only_suffix_divergence_groups_into_one_title() {
    let h = Harness::new();
    std::fs::create_dir_all(h.settings.sources_root.join("Source1").join("Manga Alpha (Official)")).unwrap();
    std::fs::create_dir_all(h.settings.sources_root.join("Source2").join("Manga Alpha")).unwrap();

    let orchestrator = h.orchestrator("groups: []\n").await;
    let summary = orchestrator.run_once(ScanReason::Manual, &HashSet::new()).await;

    assert_eq!(summary.groups, 1);
    assert_eq!(summary.titles, 2);
}

#[tokio::test]
async fn override_preserved_canonical_uses_exact_override_spelling() {
    let h = Harness::new();
    h.override_title("priority", "Manga-Beta");
    std::fs::create_dir_all(h.settings.sources_root.join("Source1").join("manga beta!")).unwrap();

    let orchestrator = h.orchestrator("groups: []\n").await;
    let summary = orchestrator.run_once(ScanReason::Manual, &HashSet::new()).await;

    assert_eq!(summary.groups, 1);
    assert_eq!(summary.actions, 1);

    let staged = dir_names(&h.settings.state_dir.join("branch-links"));
    assert_eq!(staged.len(), 1, "exactly one group staged");
    let links = dir_names(&h.settings.state_dir.join("branch-links").join(&staged[0]));
    assert!(links.iter().any(|l| l == "00_override_primary"));
}

#[tokio::test]
async fn forced_remount_on_override_write_remounts_once() {
    let h = Harness::new();
    h.override_title("priority", "Title");
    std::fs::create_dir_all(h.settings.sources_root.join("Source1").join("Title")).unwrap();

    let orchestrator = h.orchestrator("groups: []\n").await;
    let first = orchestrator.run_once(ScanReason::Manual, &HashSet::new()).await;
    assert_eq!(first.actions, 1, "first pass mounts the new group");

    let mountpoint = h.settings.merged_root.join("Title").to_string_lossy().into_owned();
    let mut forced = HashSet::new();
    forced.insert(mountpoint);
    let second = orchestrator.run_once(ScanReason::OverrideChange, &forced).await;
    assert_eq!(second.actions, 1, "forced remount is the only action on an otherwise steady-state pass");
}

#[tokio::test]
async fn unchanged_filesystem_state_is_idempotent_on_second_pass() {
    let h = Harness::new();
    h.override_title("priority", "Title");
    std::fs::create_dir_all(h.settings.sources_root.join("Source1").join("Title")).unwrap();

    let orchestrator = h.orchestrator("groups: []\n").await;
    let first = orchestrator.run_once(ScanReason::Manual, &HashSet::new()).await;
    assert_eq!(first.actions, 1);

    let second = orchestrator.run_once(ScanReason::Manual, &HashSet::new()).await;
    assert_eq!(second.actions, 0, "no drift, no actions on the following pass");
}
