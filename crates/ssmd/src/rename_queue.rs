//! Rename Queue: debounced processing of chapter-directory renames
//! (spec Section 4.8).
//!
//! Single-owner state behind a `tokio::sync::Mutex`, grounded in
//! `scheduler.rs`'s lock-guarded-state-plus-background-loop shape. Producers
//! push chapter paths via [`RenameQueue::enqueue`]; [`RenameQueue::tick`] is
//! driven by a fixed-interval poll loop in the daemon's worker set.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use ssm_core::RenameQueueEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn release_group_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]+[0-9]+[A-Za-z0-9]*$").unwrap())
}

/// Strip digits from a release-group numeric prefix, e.g.
/// `ReleaseGroup1_Ch2` → `ReleaseGroup_Ch2`, `Group1 Chapter 3` →
/// `Group Chapter 3`. Returns `None` if the name doesn't match the rule or
/// stripping digits would be a no-op.
pub fn sanitize_chapter_name(name: &str) -> Option<String> {
    let (prefix, rest) = if let Some(idx) = name.find('_') {
        (&name[..idx], &name[idx..])
    } else if let Some(idx) = name.find(' ') {
        (&name[..idx], &name[idx..])
    } else {
        return None;
    };

    if !release_group_prefix_re().is_match(prefix) {
        return None;
    }

    let stripped: String = prefix.chars().filter(|c| !c.is_ascii_digit()).collect();
    if stripped == prefix || stripped.is_empty() {
        return None;
    }

    Some(format!("{stripped}{rest}"))
}

/// Walks a directory tree and reports the newest modification time among
/// the directory itself and everything beneath it. Injected so the quiet
/// period check is testable without real filesystem timestamps.
pub trait MtimeProbe: Send + Sync {
    fn latest_mtime(&self, dir: &Path) -> Option<DateTime<Utc>>;
}

pub struct RealMtimeProbe;

impl MtimeProbe for RealMtimeProbe {
    fn latest_mtime(&self, dir: &Path) -> Option<DateTime<Utc>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let modified: DateTime<Utc> = modified.into();
            let is_newer = match latest {
                None => true,
                Some(l) => modified > l,
            };
            if is_newer {
                latest = Some(modified);
            }
        }
        latest
    }
}

#[derive(Debug, Clone)]
pub struct RenameQueueConfig {
    pub delay: ChronoDuration,
    pub quiet: ChronoDuration,
    pub rescan_grace: ChronoDuration,
}

struct TrackedEntry {
    entry: RenameQueueEntry,
    missing_since: Option<DateTime<Utc>>,
}

pub struct RenameQueue {
    config: RenameQueueConfig,
    entries: Mutex<HashMap<PathBuf, TrackedEntry>>,
}

impl RenameQueue {
    pub fn new(config: RenameQueueConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    /// `Enqueue(chapterPath)`: upsert by path, latest earliest-action wins.
    pub async fn enqueue(&self, chapter_path: PathBuf) {
        let earliest_action = Utc::now() + self.config.delay;
        self.enqueue_entry(RenameQueueEntry { chapter_path, earliest_action }).await;
    }

    /// Upsert a pre-built entry directly, e.g. a restart backfill entry
    /// whose deadline is already `now` rather than `now + delay`.
    pub async fn enqueue_entry(&self, entry: RenameQueueEntry) {
        let mut entries = self.entries.lock().await;
        entries.insert(entry.chapter_path.clone(), TrackedEntry { entry, missing_since: None });
    }

    /// One poll-interval pass: applies sanitization to every entry that is
    /// both past its delay window and quiet, drops entries that have been
    /// missing past the rescan grace period, and retains everything else.
    pub async fn tick(&self, mtime_probe: &dyn MtimeProbe) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let mut to_drop = Vec::new();

        for (path, tracked) in entries.iter_mut() {
            if !path.exists() {
                let missing_since = *tracked.missing_since.get_or_insert(now);
                if now - missing_since >= self.config.rescan_grace {
                    debug!(path = %path.display(), "dropping vanished rename-queue entry");
                    to_drop.push(path.clone());
                }
                continue;
            }
            tracked.missing_since = None;

            if !tracked.entry.is_eligible(now) {
                continue;
            }

            let Some(latest_mtime) = mtime_probe.latest_mtime(path) else {
                continue;
            };
            if now - latest_mtime < self.config.quiet {
                continue;
            }

            if let Err(e) = apply_sanitization(path) {
                warn!(path = %path.display(), error = %e, "chapter rename failed");
            }
            to_drop.push(path.clone());
        }

        for path in to_drop {
            entries.remove(&path);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Rename `path`'s final component per [`sanitize_chapter_name`], retrying
/// with `_alt-<letter>` suffixes on destination collision. A no-op name
/// (no match, or nothing to strip) leaves the path untouched.
fn apply_sanitization(path: &Path) -> std::io::Result<()> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let Some(sanitized) = sanitize_chapter_name(name) else {
        return Ok(());
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let mut destination = parent.join(&sanitized);
    if destination == path {
        return Ok(());
    }

    if !destination.exists() {
        return atomic_rename(path, &destination);
    }

    for letter in b'a'..=b'z' {
        let candidate = parent.join(format!("{sanitized}_alt-{}", letter as char));
        if !candidate.exists() {
            destination = candidate;
            return atomic_rename(path, &destination);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free _alt- suffix for {}", destination.display()),
    ))
}

fn atomic_rename(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::rename(from, to)?;
    info!(from = %from.display(), to = %to.display(), "sanitized chapter directory name");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMtime(DateTime<Utc>);

    impl MtimeProbe for FixedMtime {
        fn latest_mtime(&self, _dir: &Path) -> Option<DateTime<Utc>> {
            Some(self.0)
        }
    }

    fn config() -> RenameQueueConfig {
        RenameQueueConfig {
            delay: ChronoDuration::seconds(0),
            quiet: ChronoDuration::seconds(30),
            rescan_grace: ChronoDuration::seconds(60),
        }
    }

    #[test]
    fn sanitizes_underscore_form() {
        assert_eq!(
            sanitize_chapter_name("ReleaseGroup1_Ch2"),
            Some("ReleaseGroup_Ch2".to_string())
        );
    }

    #[test]
    fn sanitizes_space_form() {
        assert_eq!(
            sanitize_chapter_name("Group1 Chapter 3"),
            Some("Group Chapter 3".to_string())
        );
    }

    #[test]
    fn leaves_purely_alphabetic_prefix_untouched() {
        assert_eq!(sanitize_chapter_name("ReleaseGroup_Ch2"), None);
    }

    #[test]
    fn leaves_non_matching_name_untouched() {
        assert_eq!(sanitize_chapter_name("NoSeparatorHere"), None);
    }

    #[tokio::test]
    async fn enqueue_upserts_latest_earliest_action() {
        let queue = RenameQueue::new(RenameQueueConfig {
            delay: ChronoDuration::seconds(100),
            ..config()
        });
        queue.enqueue(PathBuf::from("/ssm/sources/disk1/S/Title/Ch01")).await;
        let first_deadline = {
            let entries = queue.entries.lock().await;
            entries.values().next().unwrap().entry.earliest_action
        };
        queue.enqueue(PathBuf::from("/ssm/sources/disk1/S/Title/Ch01")).await;
        let second_deadline = {
            let entries = queue.entries.lock().await;
            entries.values().next().unwrap().entry.earliest_action
        };
        assert!(second_deadline >= first_deadline);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn tick_renames_eligible_quiet_entry() {
        let dir = tempfile::tempdir().unwrap();
        let chapter = dir.path().join("ReleaseGroup1_Ch2");
        std::fs::create_dir_all(&chapter).unwrap();

        let queue = RenameQueue::new(config());
        queue.enqueue(chapter.clone()).await;

        let old_mtime = Utc::now() - ChronoDuration::seconds(120);
        queue.tick(&FixedMtime(old_mtime)).await;

        assert!(!chapter.exists());
        assert!(dir.path().join("ReleaseGroup_Ch2").exists());
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn tick_skips_entry_still_within_quiet_window() {
        let dir = tempfile::tempdir().unwrap();
        let chapter = dir.path().join("ReleaseGroup1_Ch2");
        std::fs::create_dir_all(&chapter).unwrap();

        let queue = RenameQueue::new(config());
        queue.enqueue(chapter.clone()).await;
        queue.tick(&FixedMtime(Utc::now())).await;

        assert!(chapter.exists());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn tick_drops_entry_missing_past_rescan_grace() {
        let queue = RenameQueue::new(RenameQueueConfig {
            rescan_grace: ChronoDuration::seconds(0),
            ..config()
        });
        queue.enqueue(PathBuf::from("/ssm/sources/disk1/S/Title/Ch_vanished")).await;
        queue.tick(&FixedMtime(Utc::now())).await;
        assert_eq!(queue.len().await, 0);
    }

    #[test]
    fn collision_gets_alt_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let chapter = dir.path().join("ReleaseGroup1_Ch2");
        std::fs::create_dir_all(&chapter).unwrap();
        std::fs::create_dir_all(dir.path().join("ReleaseGroup_Ch2")).unwrap();

        apply_sanitization(&chapter).unwrap();

        assert!(dir.path().join("ReleaseGroup_Ch2_alt-a").exists());
    }
}
