//! ssmd - Suwayomi Source Merger daemon
//!
//! Library components for the orchestrator daemon: configuration, the
//! Equivalence Catalog and Metadata State Store persistence layers, the
//! Branch Planner's staging and mount-application glue, the event
//! pipeline, the Rename Queue, the Scan Trigger Coalescer, the Scan
//! Orchestrator, and the top-level [`Supervisor`] that wires them
//! together (spec Section 4.10).

pub mod catalog_store;
pub mod coalescer;
pub mod events;
pub mod metadata_placement;
pub mod metadata_store;
pub mod mount_service;
pub mod mount_snapshot;
pub mod ownership;
pub mod rename_queue;
pub mod scan;
pub mod stager;

use catalog_store::CatalogStore;
use coalescer::{Coalescer, ScanReason};
use events::{EventReaderConfig, PrefixEquivalents};
use mount_service::{MountApplier, MountService, MountServiceConfig};
use mount_snapshot::FindmntSnapshotProvider;
use rename_queue::{RealMtimeProbe, RenameQueue, RenameQueueConfig};
use scan::{ScanOrchestrator, ScanSummary};
use ssm_core::{SceneTagsDocument, Settings, SourcePriorityDocument};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

const LOCK_FILE_NAME: &str = "ssmd.lock";
const PID_FILE_NAME: &str = "ssmd.pid";

/// Holds the advisory write lock for the process's lifetime; dropping it
/// releases the lock.
struct SingleInstanceLock {
    _guard: fd_lock::RwLockWriteGuard<'static, File>,
}

/// Acquire the single-instance advisory lock at `<state_dir>/ssmd.lock`.
/// Fails immediately (non-blocking) if another process already holds it.
fn acquire_single_instance_lock(state_dir: &Path) -> AppResult<SingleInstanceLock> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new().create(true).write(true).open(&path)?;

    // `fd_lock::RwLock` borrows its inner value; leaking it for the daemon's
    // lifetime avoids a self-referential struct for a lock that's held until
    // process exit anyway.
    let lock: &'static mut fd_lock::RwLock<File> = Box::leak(Box::new(fd_lock::RwLock::new(file)));
    let guard = lock.try_write().map_err(|_| {
        eyre::eyre!(
            "another ssmd instance already holds the lock at {}",
            path.display()
        )
    })?;

    Ok(SingleInstanceLock { _guard: guard })
}

fn write_pid_file(state_dir: &Path) -> io::Result<()> {
    std::fs::write(state_dir.join(PID_FILE_NAME), std::process::id().to_string())
}

fn remove_pid_file(state_dir: &Path) {
    let _ = std::fs::remove_file(state_dir.join(PID_FILE_NAME));
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

/// Load the three optional config documents and build a ready-to-use
/// [`ScanOrchestrator`]. Shared by [`Supervisor::run`] and `--once` callers.
fn build_orchestrator(settings: &Settings) -> AppResult<ScanOrchestrator> {
    let scene_tags = SceneTagsDocument::from_file(&settings.config_dir.join("scene_tags.yml"))?
        .to_scene_tags();
    let source_priority =
        SourcePriorityDocument::from_file(&settings.config_dir.join("source_priority.yml"))?;
    let catalog = CatalogStore::load(
        &settings.config_dir.join("manga_equivalents.yml"),
        &scene_tags,
    )
    .map_err(|e| eyre::eyre!("failed to load equivalence catalog: {e}"))?;

    let mount_applier: Box<dyn MountApplier> =
        Box::new(MountService::new(MountServiceConfig::from_settings(settings)));
    let snapshot_provider = Box::new(FindmntSnapshotProvider);

    Ok(ScanOrchestrator::new(
        settings.clone(),
        catalog,
        source_priority,
        scene_tags,
        mount_applier,
        snapshot_provider,
    ))
}

/// Top-level daemon lifecycle: single-instance locking, worker wiring, and
/// cooperative shutdown (spec Section 4.10).
pub struct Supervisor {
    settings: Settings,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run one scan pass and return, without acquiring the single-instance
    /// lock or starting any background workers. Used by the `--once` CLI
    /// flag for ad hoc / scripted invocations.
    pub async fn run_once(&self) -> AppResult<ScanSummary> {
        let orchestrator = build_orchestrator(&self.settings)?;
        let summary = orchestrator
            .run_once(ScanReason::Manual, &Default::default())
            .await;
        Ok(summary)
    }

    /// Run the daemon until a shutdown signal arrives. Returns `Ok(())` on
    /// clean shutdown; the caller maps errors to exit code 1.
    pub async fn run(&self) -> AppResult<()> {
        let _lock = acquire_single_instance_lock(&self.settings.state_dir)?;
        write_pid_file(&self.settings.state_dir)?;
        ownership::chown_path(&self.settings.state_dir, self.settings.puid, self.settings.pgid);

        let orchestrator = Arc::new(build_orchestrator(&self.settings)?);
        let coalescer = Arc::new(Coalescer::new());
        let rename_queue = Arc::new(RenameQueue::new(RenameQueueConfig {
            delay: chrono::Duration::seconds(self.settings.rename_delay_sec as i64),
            quiet: chrono::Duration::seconds(self.settings.rename_quiet_sec as i64),
            rescan_grace: chrono::Duration::seconds(self.settings.rename_rescan_grace_sec as i64),
        }));
        let cancel = CancellationToken::new();

        let signal_cancel = cancel.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            signal_cancel.cancel();
        });

        let event_task = self.spawn_event_reader(Arc::clone(&rename_queue), Arc::clone(&coalescer), cancel.clone());
        let rename_task = self.spawn_rename_ticker(Arc::clone(&rename_queue), cancel.clone());
        let scan_task = self.spawn_scan_driver(Arc::clone(&orchestrator), Arc::clone(&coalescer), cancel.clone());

        cancel.cancelled().await;
        info!("shutdown initiated, waiting for workers to stop");

        let shutdown_deadline = Duration::from_secs(self.settings.supervisor_shutdown_deadline_sec);
        let workers = async {
            let _ = tokio::join!(event_task, rename_task, scan_task);
        };
        if tokio::time::timeout(shutdown_deadline, workers).await.is_err() {
            warn!(
                deadline_sec = self.settings.supervisor_shutdown_deadline_sec,
                "workers did not stop within the shutdown deadline"
            );
        }
        signal_task.abort();

        remove_pid_file(&self.settings.state_dir);
        info!("ssmd stopped");
        Ok(())
    }

    fn spawn_event_reader(
        &self,
        rename_queue: Arc<RenameQueue>,
        coalescer: Arc<Coalescer>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let config = EventReaderConfig {
            watched_roots: vec![self.settings.sources_root.clone(), self.settings.override_root.clone()],
            sources_root: self.settings.sources_root.to_string_lossy().into_owned(),
            override_root: self.settings.override_root.to_string_lossy().into_owned(),
            prefix_equivalents: PrefixEquivalents(Vec::new()),
            restart_backoff: Duration::from_secs(self.settings.event_reader_restart_backoff_sec),
        };

        let restart_sources_root = config.sources_root.clone();
        let restart_rename_queue = Arc::clone(&rename_queue);

        tokio::spawn(async move {
            events::run(
                &config,
                &cancel,
                |classified| {
                    let reason = match classified.class {
                        ssm_core::EventClass::NewSource | ssm_core::EventClass::NewManga => {
                            let rename_queue = Arc::clone(&rename_queue);
                            let sources_root = config.sources_root.clone();
                            let new_root = PathBuf::from(&classified.canonical_path);
                            tokio::spawn(async move {
                                for chapter_path in events::enumerate_chapter_dirs(&new_root, &sources_root) {
                                    rename_queue.enqueue(chapter_path).await;
                                }
                            });
                            if classified.class == ssm_core::EventClass::NewSource {
                                Some(ScanReason::NewSource)
                            } else {
                                Some(ScanReason::NewManga)
                            }
                        }
                        ssm_core::EventClass::NewChapter => {
                            let rename_queue = Arc::clone(&rename_queue);
                            let path = PathBuf::from(&classified.canonical_path);
                            tokio::spawn(async move { rename_queue.enqueue(path).await });
                            Some(ScanReason::NewChapter)
                        }
                        ssm_core::EventClass::OverrideChange => Some(ScanReason::OverrideChange),
                        ssm_core::EventClass::Noise => None,
                    };
                    if let Some(reason) = reason {
                        let coalescer = Arc::clone(&coalescer);
                        tokio::spawn(async move { coalescer.request_scan(reason).await });
                    }
                },
                move || {
                    let sources_root = restart_sources_root.clone();
                    let rename_queue = Arc::clone(&restart_rename_queue);
                    tokio::spawn(async move {
                        let root = PathBuf::from(&sources_root);
                        for chapter_path in events::enumerate_chapter_dirs(&root, &sources_root) {
                            rename_queue.enqueue_entry(events::backfill_entry(chapter_path)).await;
                        }
                    });
                },
            )
            .await;
        })
    }

    fn spawn_rename_ticker(
        &self,
        rename_queue: Arc<RenameQueue>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tick_interval = Duration::from_secs(self.settings.rename_quiet_sec.max(1));
        tokio::spawn(async move {
            let probe = RealMtimeProbe;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(tick_interval) => rename_queue.tick(&probe).await,
                    () = cancel.cancelled() => return,
                }
            }
        })
    }

    fn spawn_scan_driver(
        &self,
        orchestrator: Arc<ScanOrchestrator>,
        coalescer: Arc<Coalescer>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let min_interval = chrono::Duration::seconds(self.settings.scan_min_interval_sec as i64);
        let poll_interval = Duration::from_secs(self.settings.scan_lock_retry_sec.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    () = cancel.cancelled() => return,
                }
                if let Some(reason) = coalescer.try_start(min_interval).await {
                    let summary = orchestrator.run_once(reason, &Default::default()).await;
                    info!(?reason, groups = summary.groups, actions = summary.actions, "scan pass dispatched");
                    coalescer.finish().await;
                }
            }
        })
    }
}
