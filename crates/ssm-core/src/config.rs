//! Configuration parsing for the orchestrator daemon.
//!
//! Loads the four YAML documents under `/ssm/config` (Section 6):
//! `settings.yml` ([`Settings`]), `manga_equivalents.yml`
//! ([`crate::equivalence::EquivalenceDocument`]), `scene_tags.yml`
//! ([`SceneTagsDocument`]), and `source_priority.yml`
//! ([`SourcePriorityDocument`]). Each document deserializes with
//! `#[serde(default)]` field defaults so a partial or missing file still
//! produces a usable configuration.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Daemon operational settings (`settings.yml`).
///
/// Field names match the filesystem layout and component knobs from
/// Sections 4-6.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sources_root: PathBuf,
    pub override_root: PathBuf,
    pub merged_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_dir: PathBuf,

    /// Source directory names excluded from enumeration (case/punctuation
    /// insensitive comparison is applied by the caller).
    pub excluded_sources: Vec<String>,

    /// Options passed to `mergerfs -o <opts>,fsname=<identity>`. A
    /// `threads=` token is appended by the Mount Command Service if absent.
    pub mergerfs_base_options: String,

    pub mount_command_timeout_sec: u64,
    pub unmount_command_timeout_sec: u64,
    pub readiness_probe_timeout_sec: u64,
    pub command_kill_grace_sec: u64,

    /// Consecutive mount/remount failures before a scan pass aborts its
    /// remaining actions.
    pub circuit_breaker_threshold: u32,

    pub scan_min_interval_sec: u64,
    pub scan_lock_retry_sec: u64,

    pub rename_delay_sec: u64,
    pub rename_quiet_sec: u64,
    pub rename_rescan_grace_sec: u64,

    pub event_reader_restart_backoff_sec: u64,

    pub health_checks_enabled: bool,

    /// How many of the slowest per-stage timings to record in the pass
    /// summary, and the minimum duration (ms) worth recording at all.
    pub timing_slowest_n: usize,
    pub timing_slowest_min_ms: u64,

    pub supervisor_shutdown_deadline_sec: u64,

    /// Effective uid/gid for files created by this system (defaults 99/100,
    /// matching the `PUID`/`PGID` environment convention).
    pub puid: u32,
    pub pgid: u32,

    /// Wrap unmount attempts with `ionice`/`nice` when set.
    pub high_priority_cleanup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources_root: PathBuf::from("/ssm/sources"),
            override_root: PathBuf::from("/ssm/override"),
            merged_root: PathBuf::from("/ssm/merged"),
            state_dir: PathBuf::from("/ssm/state"),
            config_dir: PathBuf::from("/ssm/config"),
            excluded_sources: Vec::new(),
            mergerfs_base_options: "cache.files=partial,dropcacheonclose=true,category.action=all,category.create=ff".to_string(),
            mount_command_timeout_sec: 30,
            unmount_command_timeout_sec: 15,
            readiness_probe_timeout_sec: 5,
            command_kill_grace_sec: 5,
            circuit_breaker_threshold: 5,
            scan_min_interval_sec: 30,
            scan_lock_retry_sec: 5,
            rename_delay_sec: 30,
            rename_quiet_sec: 10,
            rename_rescan_grace_sec: 300,
            event_reader_restart_backoff_sec: 5,
            health_checks_enabled: true,
            timing_slowest_n: 5,
            timing_slowest_min_ms: 50,
            supervisor_shutdown_deadline_sec: 30,
            puid: 99,
            pgid: 100,
            high_priority_cleanup: false,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve relative roots against a base directory (used by `--once`
    /// and test runs that pass non-absolute roots on the command line).
    pub fn resolve_paths(&mut self, base: &Path) {
        for field in [
            &mut self.sources_root,
            &mut self.override_root,
            &mut self.merged_root,
            &mut self.state_dir,
            &mut self.config_dir,
        ] {
            if field.is_relative() {
                *field = base.join(&field);
            }
        }
    }
}

/// `scene_tags.yml`: the configured trailing suffixes stripped during
/// title comparison (Section 4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SceneTagsDocument {
    pub tags: Vec<String>,
}

impl SceneTagsDocument {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_yaml_document(path)
    }

    pub fn to_scene_tags(&self) -> Vec<crate::normalize::SceneTag> {
        self.tags.iter().map(crate::normalize::SceneTag::new).collect()
    }
}

/// `source_priority.yml`: the caller-supplied order sources are considered
/// in when building a [`crate::planner::MergerfsBranchPlan`] (Section 4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourcePriorityDocument {
    pub sources: Vec<String>,
}

impl SourcePriorityDocument {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_yaml_document(path)
    }

    /// Rank of `source_name` for sorting (lower sorts first); names absent
    /// from the document sort after all listed names, in the order they
    /// were encountered by the caller.
    pub fn rank(&self, source_name: &str) -> usize {
        self.sources
            .iter()
            .position(|s| s == source_name)
            .unwrap_or(self.sources.len())
    }
}

fn load_yaml_document<T: Default + serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, ConfigError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}
