//! Scan Orchestrator: the per-pass pipeline from source enumeration through
//! applied mount actions (spec Section 4.6). Entry point [`ScanOrchestrator::run_once`]
//! implements `RunOneScan(reason)`.

use crate::catalog_store::CatalogStore;
use crate::coalescer::ScanReason;
use crate::mount_service::{MountApplier, SnapshotProvider};
use crate::stager;
use ssm_core::planner::{plan_group, DirExists, OverrideVolume, RealDirExists, SourceBranch};
use ssm_core::{DesiredMount, MergerfsBranchPlan, SceneTag, Settings, SourcePriorityDocument, TitleNormalizer};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One raw title directory found under a source volume, before grouping.
#[derive(Debug, Clone)]
struct DiscoveredTitle {
    source_name: String,
    raw_name: String,
    path: PathBuf,
    comparison_key: String,
}

struct SourceVolumeEntry {
    name: String,
    root: PathBuf,
}

/// Lowercased, non-alphanumeric-stripped form used only for matching
/// source-volume names against the excluded-sources list — deliberately
/// simpler than full Title Normalization (no scene-tag stripping applies
/// to volume names).
fn fold_name(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn enumerate_source_volumes(sources_root: &Path, excluded: &[String]) -> Vec<SourceVolumeEntry> {
    let excluded_folded: HashSet<String> = excluded.iter().map(|s| fold_name(s)).collect();
    let Ok(entries) = std::fs::read_dir(sources_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !excluded_folded.contains(&fold_name(name)))
        .map(|name| SourceVolumeEntry { root: sources_root.join(&name), name })
        .collect()
}

fn enumerate_titles_for_volume(
    volume: &SourceVolumeEntry,
    scene_tags: &[SceneTag],
    normalizer: &TitleNormalizer,
) -> Vec<DiscoveredTitle> {
    let Ok(entries) = std::fs::read_dir(&volume.root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .map(|raw_name| DiscoveredTitle {
            source_name: volume.name.clone(),
            comparison_key: normalizer.comparison_key(&raw_name, scene_tags),
            path: volume.root.join(&raw_name),
            raw_name,
        })
        .collect()
}

fn enumerate_override_volumes(override_root: &Path) -> Vec<OverrideVolume> {
    let Ok(entries) = std::fs::read_dir(override_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .map(|name| OverrideVolume { root: override_root.join(&name), name })
        .collect()
}

/// Pick the canonical display title for a group: equivalence catalog, then
/// an exact-name override directory, then the first-seen raw title.
fn pick_canonical(
    group: &[DiscoveredTitle],
    catalog: &CatalogStore,
    override_volumes: &[OverrideVolume],
    scene_tags: &[SceneTag],
) -> String {
    for title in group {
        if let Some(resolution) = catalog.resolve(&title.raw_name, scene_tags) {
            return resolution.canonical;
        }
    }

    for title in group {
        for volume in override_volumes {
            if volume.root.join(&title.raw_name).is_dir() {
                return title.raw_name.clone();
            }
        }
    }

    group[0].raw_name.clone()
}

#[derive(Debug, Default, Clone)]
pub struct ScanSummary {
    pub sources: usize,
    pub titles: usize,
    pub groups: usize,
    pub actions: usize,
    pub mount_ops: usize,
    pub failures: usize,
    pub aborted_by_circuit_breaker: bool,
    pub duration: Duration,
    pub stage_timings: Vec<(&'static str, Duration)>,
}

impl ScanSummary {
    /// Slowest-N per-stage timings at or above `min_ms`, per spec's
    /// configurable timing summary.
    pub fn slowest_stages(&self, n: usize, min_ms: u64) -> Vec<(&'static str, Duration)> {
        let mut timings: Vec<_> = self
            .stage_timings
            .iter()
            .filter(|(_, d)| d.as_millis() as u64 >= min_ms)
            .cloned()
            .collect();
        timings.sort_by(|a, b| b.1.cmp(&a.1));
        timings.truncate(n);
        timings
    }
}

pub struct ScanOrchestrator {
    settings: Settings,
    catalog: CatalogStore,
    source_priority: SourcePriorityDocument,
    scene_tags: Vec<SceneTag>,
    normalizer: TitleNormalizer,
    mount_applier: Box<dyn MountApplier>,
    snapshot_provider: Box<dyn SnapshotProvider>,
    dir_exists: Box<dyn DirExists + Send + Sync>,
    branch_links_root: PathBuf,
}

impl ScanOrchestrator {
    pub fn new(
        settings: Settings,
        catalog: CatalogStore,
        source_priority: SourcePriorityDocument,
        scene_tags: Vec<SceneTag>,
        mount_applier: Box<dyn MountApplier>,
        snapshot_provider: Box<dyn SnapshotProvider>,
    ) -> Self {
        let branch_links_root = settings.state_dir.join("branch-links");
        Self {
            settings,
            catalog,
            source_priority,
            scene_tags,
            normalizer: TitleNormalizer::new(),
            mount_applier,
            snapshot_provider,
            dir_exists: Box::new(RealDirExists),
            branch_links_root,
        }
    }

    /// `RunOneScan(reason)`: one full pass, per spec Section 4.6's 8-step
    /// sequence. `forced_remounts` names mountpoints an override-root event
    /// requires remounting regardless of identity match.
    pub async fn run_once(&self, reason: ScanReason, forced_remounts: &HashSet<String>) -> ScanSummary {
        let pass_start = Instant::now();
        let mut stage_timings = Vec::new();
        info!(?reason, "scan pass starting");

        let enumerate_start = Instant::now();
        let volumes = enumerate_source_volumes(&self.settings.sources_root, &self.settings.excluded_sources);
        let mut titles: Vec<DiscoveredTitle> = Vec::new();
        for volume in &volumes {
            titles.extend(enumerate_titles_for_volume(volume, &self.scene_tags, &self.normalizer));
        }
        let override_volumes = enumerate_override_volumes(&self.settings.override_root);
        stage_timings.push(("enumerate", enumerate_start.elapsed()));

        let group_start = Instant::now();
        let mut groups: HashMap<String, Vec<DiscoveredTitle>> = HashMap::new();
        for title in titles.drain(..) {
            groups.entry(title.comparison_key.clone()).or_default().push(title);
        }
        stage_timings.push(("group", group_start.elapsed()));

        let plan_start = Instant::now();
        let mut desired_mounts = Vec::new();
        let mut plans_by_mountpoint: HashMap<String, MergerfsBranchPlan> = HashMap::new();
        let mut live_group_ids: HashSet<String> = HashSet::new();

        for (group_key, group_titles) in &groups {
            let canonical = pick_canonical(group_titles, &self.catalog, &override_volumes, &self.scene_tags);

            let mut source_branches: Vec<SourceBranch> = group_titles
                .iter()
                .map(|t| SourceBranch { path: t.path.clone(), source_name: t.source_name.clone() })
                .collect();
            source_branches.sort_by(|a, b| {
                self.source_priority
                    .rank(&a.source_name)
                    .cmp(&self.source_priority.rank(&b.source_name))
                    .then_with(|| a.source_name.cmp(&b.source_name))
            });

            let Some(plan) = plan_group(
                group_key,
                &canonical,
                &self.branch_links_root,
                &override_volumes,
                &source_branches,
                self.dir_exists.as_ref(),
            ) else {
                warn!(canonical, "no override volume configured, skipping group");
                continue;
            };

            if let Err(e) = stager::stage(&plan) {
                warn!(canonical, error = %e, "failed to stage branch links for group");
                continue;
            }

            live_group_ids.insert(plan.group_id.clone());
            let mountpoint = self.settings.merged_root.join(&canonical).to_string_lossy().into_owned();
            desired_mounts.push(DesiredMount {
                mountpoint: mountpoint.clone(),
                desired_identity: plan.desired_identity.clone(),
                branch_spec: plan.branch_spec.clone(),
                healthy: None,
            });
            plans_by_mountpoint.insert(mountpoint, plan);
        }
        stage_timings.push(("plan_and_stage", plan_start.elapsed()));

        let snapshot_start = Instant::now();
        let observed = match self.snapshot_provider.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "failed to take mount snapshot, aborting pass");
                return ScanSummary {
                    sources: volumes.len(),
                    titles: 0,
                    groups: groups.len(),
                    duration: pass_start.elapsed(),
                    stage_timings,
                    ..ScanSummary::default()
                };
            }
        };
        stage_timings.push(("snapshot", snapshot_start.elapsed()));

        let managed_roots = vec![self.settings.merged_root.to_string_lossy().into_owned()];
        let actions = ssm_core::mount::reconcile(
            &desired_mounts,
            &observed,
            forced_remounts,
            &managed_roots,
            self.settings.health_checks_enabled,
        );

        let apply_start = Instant::now();
        let mut mount_ops = 0usize;
        let mut failures = 0usize;
        let mut consecutive_failures = 0u32;
        let mut aborted = false;

        for action in &actions {
            if consecutive_failures >= self.settings.circuit_breaker_threshold {
                aborted = true;
                warn!(threshold = self.settings.circuit_breaker_threshold, "circuit breaker tripped, aborting remaining actions");
                break;
            }

            let plan = plans_by_mountpoint.get(&action.mountpoint);
            let outcome = self
                .mount_applier
                .apply(action, plan, &self.settings.mergerfs_base_options, self.snapshot_provider.as_ref())
                .await;
            mount_ops += 1;

            if outcome.counts_toward_circuit_breaker() {
                failures += 1;
                consecutive_failures += 1;
                warn!(mountpoint = %action.mountpoint, ?outcome, "mount action failed");
            } else {
                consecutive_failures = 0;
            }
        }
        stage_timings.push(("apply", apply_start.elapsed()));

        let cleanup_start = Instant::now();
        clean_stale_branch_links(&self.branch_links_root, &live_group_ids);
        stage_timings.push(("cleanup_stale_links", cleanup_start.elapsed()));

        let summary = ScanSummary {
            sources: volumes.len(),
            titles: groups.values().map(Vec::len).sum(),
            groups: groups.len(),
            actions: actions.len(),
            mount_ops,
            failures,
            aborted_by_circuit_breaker: aborted,
            duration: pass_start.elapsed(),
            stage_timings,
        };
        info!(
            sources = summary.sources,
            titles = summary.titles,
            groups = summary.groups,
            actions = summary.actions,
            mount_ops = summary.mount_ops,
            failures = summary.failures,
            aborted = summary.aborted_by_circuit_breaker,
            duration_ms = summary.duration.as_millis() as u64,
            "scan pass complete"
        );
        summary
    }
}

fn clean_stale_branch_links(branch_links_root: &Path, live_group_ids: &HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(branch_links_root) else {
        return;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
        if live_group_ids.contains(&name) {
            continue;
        }
        if let Err(e) = stager::remove_group_dir(&entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "failed to remove stale branch-link directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_name_strips_case_and_punctuation() {
        assert_eq!(fold_name("My-Source_1"), "mysource1");
    }

    #[test]
    fn enumerate_source_volumes_excludes_configured_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("disk1")).unwrap();
        std::fs::create_dir_all(dir.path().join("Disk-2")).unwrap();

        let volumes = enumerate_source_volumes(dir.path(), &["disk2".to_string()]);
        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["disk1"]);
    }

    #[test]
    fn enumerate_titles_for_volume_computes_comparison_keys() {
        let dir = tempfile::tempdir().unwrap();
        let volume_root = dir.path().join("disk1");
        std::fs::create_dir_all(volume_root.join("Manga Title")).unwrap();

        let volume = SourceVolumeEntry { name: "disk1".to_string(), root: volume_root };
        let normalizer = TitleNormalizer::new();
        let titles = enumerate_titles_for_volume(&volume, &[], &normalizer);
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].comparison_key, "mangatitle");
    }

    #[test]
    fn pick_canonical_prefers_exact_override_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("override/priority/Manga Title!")).unwrap();
        let override_volumes = vec![OverrideVolume { root: dir.path().join("override/priority"), name: "priority".to_string() }];

        let group = vec![DiscoveredTitle {
            source_name: "disk1".to_string(),
            raw_name: "Manga Title!".to_string(),
            path: PathBuf::from("/ssm/sources/disk1/Manga Title!"),
            comparison_key: "mangatitle".to_string(),
        }];

        let empty_catalog = CatalogStore::load(&dir.path().join("manga_equivalents.yml"), &[]).unwrap();
        let canonical = pick_canonical(&group, &empty_catalog, &override_volumes, &[]);
        assert_eq!(canonical, "Manga Title!");
    }

    #[test]
    fn pick_canonical_falls_back_to_first_seen_raw_title() {
        let dir = tempfile::tempdir().unwrap();
        let group = vec![DiscoveredTitle {
            source_name: "disk1".to_string(),
            raw_name: "First Seen".to_string(),
            path: PathBuf::from("/ssm/sources/disk1/First Seen"),
            comparison_key: "firstseen".to_string(),
        }];
        let empty_catalog = CatalogStore::load(&dir.path().join("manga_equivalents.yml"), &[]).unwrap();
        let canonical = pick_canonical(&group, &empty_catalog, &[], &[]);
        assert_eq!(canonical, "First Seen");
    }

    #[test]
    fn clean_stale_branch_links_removes_only_dead_groups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("live_group")).unwrap();
        std::fs::create_dir_all(dir.path().join("dead_group")).unwrap();

        let mut live = HashSet::new();
        live.insert("live_group".to_string());
        clean_stale_branch_links(dir.path(), &live);

        assert!(dir.path().join("live_group").exists());
        assert!(!dir.path().join("dead_group").exists());
    }

    #[test]
    fn slowest_stages_filters_and_truncates() {
        let summary = ScanSummary {
            stage_timings: vec![
                ("a", Duration::from_millis(10)),
                ("b", Duration::from_millis(200)),
                ("c", Duration::from_millis(100)),
            ],
            ..ScanSummary::default()
        };
        let slowest = summary.slowest_stages(1, 50);
        assert_eq!(slowest, vec![("b", Duration::from_millis(200))]);
    }
}
