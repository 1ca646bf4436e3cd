//! Mount Command Service: applies one reconciler action at a time by
//! invoking `mergerfs`/`fusermount3`/`fusermount`/`umount` as external
//! commands, with a timeout-and-kill-escalation wrapper (spec Section 4.5).

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use ssm_core::{ActionKind, MergerfsBranchPlan, MountAction, MountSnapshotEntry};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

const TRANSPORT_NOT_CONNECTED: &str = "Transport endpoint is not connected";

/// Classification of a single external-command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    FailedRetryable { reason: String },
    FailedFatal { reason: String },
    TimedOut,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn counts_toward_circuit_breaker(&self) -> bool {
        !matches!(self, Self::Succeeded)
    }
}

fn describe_outcome(outcome: CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Succeeded => "succeeded".to_string(),
        CommandOutcome::FailedRetryable { reason } | CommandOutcome::FailedFatal { reason } => reason,
        CommandOutcome::TimedOut => "timed out".to_string(),
    }
}

/// Tunables for the timeout-and-poll wrapper (Section 5, Section 6).
#[derive(Debug, Clone)]
pub struct MountServiceConfig {
    pub mount_timeout: Duration,
    pub unmount_timeout: Duration,
    pub readiness_timeout: Duration,
    pub kill_grace: Duration,
    pub high_priority_cleanup: bool,
}

impl Default for MountServiceConfig {
    fn default() -> Self {
        Self {
            mount_timeout: Duration::from_secs(30),
            unmount_timeout: Duration::from_secs(15),
            readiness_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            high_priority_cleanup: false,
        }
    }
}

impl MountServiceConfig {
    pub fn from_settings(settings: &ssm_core::Settings) -> Self {
        Self {
            mount_timeout: Duration::from_secs(settings.mount_command_timeout_sec),
            unmount_timeout: Duration::from_secs(settings.unmount_command_timeout_sec),
            readiness_timeout: Duration::from_secs(settings.readiness_probe_timeout_sec),
            kill_grace: Duration::from_secs(settings.command_kill_grace_sec),
            high_priority_cleanup: settings.high_priority_cleanup,
        }
    }
}

/// Provides a fresh `findmnt` snapshot; injected so Remount's "verify
/// absence" step is testable without shelling out. Production code backs
/// this with [`crate::mount_snapshot::take_snapshot`].
#[async_trait::async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> std::io::Result<Vec<MountSnapshotEntry>>;
}

/// Applies one reconciler action; implemented by [`MountService`] and
/// injectable in the scan orchestrator's tests so a pass can be exercised
/// without shelling out to real `mergerfs`/`fusermount` binaries.
#[async_trait::async_trait]
pub trait MountApplier: Send + Sync {
    async fn apply(
        &self,
        action: &MountAction,
        plan: Option<&MergerfsBranchPlan>,
        mergerfs_base_options: &str,
        snapshot_provider: &dyn SnapshotProvider,
    ) -> CommandOutcome;
}

pub struct MountService {
    config: MountServiceConfig,
}

#[async_trait::async_trait]
impl MountApplier for MountService {
    async fn apply(
        &self,
        action: &MountAction,
        plan: Option<&MergerfsBranchPlan>,
        mergerfs_base_options: &str,
        snapshot_provider: &dyn SnapshotProvider,
    ) -> CommandOutcome {
        MountService::apply(self, action, plan, mergerfs_base_options, snapshot_provider).await
    }
}

impl MountService {
    pub fn new(config: MountServiceConfig) -> Self {
        Self { config }
    }

    /// Apply one reconciler action. `plan` supplies the branch spec and
    /// options for `Mount`/`Remount`; ignored for `Unmount`.
    pub async fn apply(
        &self,
        action: &MountAction,
        plan: Option<&MergerfsBranchPlan>,
        mergerfs_base_options: &str,
        snapshot_provider: &dyn SnapshotProvider,
    ) -> CommandOutcome {
        match action.kind {
            ActionKind::Mount => {
                let Some(plan) = plan else {
                    return CommandOutcome::FailedFatal {
                        reason: "Mount action requires a branch plan".to_string(),
                    };
                };
                self.mount(action, plan, mergerfs_base_options).await
            }
            ActionKind::Unmount => self.unmount(&action.mountpoint).await,
            ActionKind::Remount => {
                let Some(plan) = plan else {
                    return CommandOutcome::FailedFatal {
                        reason: "Remount action requires a branch plan".to_string(),
                    };
                };
                self.remount(action, plan, mergerfs_base_options, snapshot_provider).await
            }
        }
    }

    async fn mount(
        &self,
        action: &MountAction,
        plan: &MergerfsBranchPlan,
        base_options: &str,
    ) -> CommandOutcome {
        let identity = action
            .desired_identity
            .as_deref()
            .unwrap_or(&plan.desired_identity);
        let branch_spec = action.branch_spec.as_deref().unwrap_or(&plan.branch_spec);

        let options = if base_options.split(',').any(|tok| tok.starts_with("threads=")) {
            format!("{base_options},fsname={identity}")
        } else {
            format!("{base_options},threads=1,fsname={identity}")
        };

        info!(mountpoint = %action.mountpoint, identity, "mounting mergerfs union");
        self.run(
            "mergerfs",
            &["-o", &options, branch_spec, &action.mountpoint],
            self.config.mount_timeout,
        )
        .await
    }

    async fn unmount(&self, mountpoint: &str) -> CommandOutcome {
        // Try every strategy once regardless of how an earlier one failed
        // (a missing `fusermount3` binary must not block `fusermount`/
        // `umount` from being attempted); only success short-circuits.
        let mut last_outcome = None;
        for (program, args) in [
            ("fusermount3", vec!["-u", mountpoint]),
            ("fusermount", vec!["-u", mountpoint]),
            ("umount", vec![mountpoint]),
        ] {
            let outcome = if self.config.high_priority_cleanup {
                let mut wrapped = vec!["-c2", "-n0", "nice", "-n", "-5", program];
                wrapped.extend(args.iter());
                self.run("ionice", &wrapped, self.config.unmount_timeout).await
            } else {
                self.run(program, &args, self.config.unmount_timeout).await
            };

            if outcome.is_success() {
                return outcome;
            }
            last_outcome = Some(outcome);
        }
        CommandOutcome::FailedRetryable {
            reason: format!(
                "all unmount strategies failed for {mountpoint}: {}",
                last_outcome.map(describe_outcome).unwrap_or_default()
            ),
        }
    }

    async fn remount(
        &self,
        action: &MountAction,
        plan: &MergerfsBranchPlan,
        base_options: &str,
        snapshot_provider: &dyn SnapshotProvider,
    ) -> CommandOutcome {
        let unmount_outcome = self.unmount(&action.mountpoint).await;
        if !unmount_outcome.is_success() {
            warn!(mountpoint = %action.mountpoint, "remount's unmount step failed");
            return unmount_outcome;
        }

        match snapshot_provider.snapshot().await {
            Ok(snapshot) => {
                if snapshot.iter().any(|e| e.mountpoint == action.mountpoint) {
                    return CommandOutcome::FailedRetryable {
                        reason: format!("{} still present after unmount", action.mountpoint),
                    };
                }
            }
            Err(e) => {
                return CommandOutcome::FailedRetryable {
                    reason: format!("failed to take verification snapshot: {e}"),
                }
            }
        }

        self.mount(action, plan, base_options).await
    }

    /// `ls -A <mountpoint>` under the command timeout; success iff it
    /// exits 0 within budget.
    pub async fn probe_readiness(&self, mountpoint: &str) -> bool {
        let outcome = self.run("ls", &["-A", mountpoint], self.config.readiness_timeout).await;
        outcome.is_success()
    }

    async fn run(&self, program: &str, args: &[&str], timeout_dur: Duration) -> CommandOutcome {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CommandOutcome::FailedFatal {
                    reason: format!("{program} not found on PATH"),
                }
            }
            Err(e) => {
                return CommandOutcome::FailedFatal {
                    reason: format!("failed to spawn {program}: {e}"),
                }
            }
        };

        let pid = child.id();

        match timeout(timeout_dur, child.wait_with_output()).await {
            Ok(Ok(output)) => classify_output(program, &output),
            Ok(Err(e)) => CommandOutcome::FailedFatal {
                reason: format!("{program} io error: {e}"),
            },
            Err(_elapsed) => {
                if let Some(pid) = pid {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    tokio::time::sleep(self.config.kill_grace).await;
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                warn!(program, timeout_sec = timeout_dur.as_secs(), "command timed out");
                CommandOutcome::TimedOut
            }
        }
    }
}

fn classify_output(program: &str, output: &std::process::Output) -> CommandOutcome {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() {
        if stderr.contains(TRANSPORT_NOT_CONNECTED) {
            return CommandOutcome::FailedRetryable {
                reason: TRANSPORT_NOT_CONNECTED.to_string(),
            };
        }
        return CommandOutcome::Succeeded;
    }

    if stderr.contains(TRANSPORT_NOT_CONNECTED) {
        return CommandOutcome::FailedRetryable {
            reason: TRANSPORT_NOT_CONNECTED.to_string(),
        };
    }

    CommandOutcome::FailedRetryable {
        reason: format!(
            "{program} exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        ),
    }
}
