//! Event Reader & Classifier: persistent `inotifywait` subprocess ingestion,
//! path normalization, and event classification (spec Section 4.7).

use chrono::Utc;
use ssm_core::pathsafe::{depth_below, is_at_or_below};
use ssm_core::{EventClass, WatchEvent};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A `(physical_prefix, canonical_prefix)` mapping used to fold watched
/// per-disk roots back onto their user-share path (e.g. `/mnt/disk1/shares`
/// → `/mnt/user`).
#[derive(Debug, Clone)]
pub struct PrefixEquivalents(pub Vec<(String, String)>);

impl PrefixEquivalents {
    pub fn normalize(&self, path: &str) -> String {
        for (physical, canonical) in &self.0 {
            if let Some(rest) = path.strip_prefix(physical.as_str()) {
                return format!("{canonical}{rest}");
            }
        }
        path.to_string()
    }
}

/// A single classified, normalized event ready for dispatch to the Rename
/// Queue and/or Scan Trigger Coalescer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub canonical_path: String,
    pub class: EventClass,
}

/// Parse one `inotifywait -qq -m -r` line of the form `%w%f|%e1,%e2,...`.
/// Splits on the last `|` since the path itself may contain no `|` in
/// practice but event names never do.
pub fn parse_line(line: &str) -> Option<WatchEvent> {
    let (path, events) = line.rsplit_once('|')?;
    if path.is_empty() {
        return None;
    }
    Some(WatchEvent {
        path: path.to_string(),
        event_kinds: events.split(',').map(str::to_string).collect(),
    })
}

const OVERRIDE_TRIGGER_KINDS: &[&str] = &["CREATE", "CLOSE_WRITE", "ATTRIB", "MOVED_TO"];

/// Classify a normalized event path relative to the sources and override
/// roots.
pub fn classify(event: &WatchEvent, sources_root: &str, override_root: &str) -> EventClass {
    if is_at_or_below(override_root, &event.path)
        && event.event_kinds.iter().any(|k| OVERRIDE_TRIGGER_KINDS.contains(&k.as_str()))
    {
        return EventClass::OverrideChange;
    }

    match depth_below(sources_root, &event.path).and_then(EventClass::from_sources_depth) {
        Some(class) => class,
        None => EventClass::Noise,
    }
}

#[derive(Debug, Clone)]
pub struct EventReaderConfig {
    pub watched_roots: Vec<PathBuf>,
    pub sources_root: String,
    pub override_root: String,
    pub prefix_equivalents: PrefixEquivalents,
    pub restart_backoff: Duration,
}

/// Spawns `inotifywait` and streams classified events to `on_event` until
/// `cancel` fires. Restarts the subprocess with `restart_backoff` on any
/// exit. `on_restart` runs once before every `inotifywait` spawn, including
/// the very first one, so the caller can enumerate current state and
/// backfill chapter directories missed while no reader was running.
pub async fn run<F, B>(
    config: &EventReaderConfig,
    cancel: &CancellationToken,
    mut on_event: F,
    mut on_restart: B,
) where
    F: FnMut(ClassifiedEvent),
    B: FnMut(),
{
    loop {
        if cancel.is_cancelled() {
            return;
        }

        on_restart();

        info!(roots = ?config.watched_roots, "starting inotifywait reader");
        match read_until_exit(config, cancel, &mut on_event).await {
            Ok(()) => debug!("inotifywait exited cleanly"),
            Err(e) => warn!(error = %e, "inotifywait reader failed"),
        }

        if cancel.is_cancelled() {
            return;
        }

        warn!(backoff_ms = config.restart_backoff.as_millis(), "restarting inotifywait reader after backoff");
        tokio::select! {
            () = tokio::time::sleep(config.restart_backoff) => {}
            () = cancel.cancelled() => return,
        }
    }
}

async fn read_until_exit<F>(
    config: &EventReaderConfig,
    cancel: &CancellationToken,
    on_event: &mut F,
) -> std::io::Result<()>
where
    F: FnMut(ClassifiedEvent),
{
    let mut cmd = Command::new("inotifywait");
    cmd.args(["-qq", "-m", "-r", "-e", "create,moved_to,close_write,attrib,delete,moved_from"]);
    for root in &config.watched_roots {
        cmd.arg(root);
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Some(event) = parse_line(&line) {
                    let canonical_path = config.prefix_equivalents.normalize(&event.path);
                    let normalized = WatchEvent { path: canonical_path.clone(), event_kinds: event.event_kinds };
                    let class = classify(&normalized, &config.sources_root, &config.override_root);
                    on_event(ClassifiedEvent { canonical_path, class });
                }
            }
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                break;
            }
        }
    }

    let _ = child.wait().await;
    Ok(())
}

/// Backfill sentinel: a chapter directory discovered missed during
/// downtime, enqueued with deadline = now (spec Section 4.7's restart
/// recovery step).
pub fn backfill_entry(chapter_path: PathBuf) -> ssm_core::RenameQueueEntry {
    ssm_core::RenameQueueEntry { chapter_path, earliest_action: Utc::now() }
}

/// Walk `root` and return every descendant directory that sits at chapter
/// depth (depth 3 below `sources_root`). Used both for a depth-1/2 event's
/// "enqueue renames for all chapters under" requirement (`root` is the new
/// source or manga directory) and for restart backfill (`root` is the
/// sources root itself).
pub fn enumerate_chapter_dirs(root: &Path, sources_root: &str) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| {
            let path = entry.path();
            let depth = depth_below(sources_root, path.to_str()?)?;
            (depth == 3).then(|| path.to_path_buf())
        })
        .collect()
}
