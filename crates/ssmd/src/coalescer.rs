//! Scan Trigger Coalescer: absorbs multiple scan requests into at most one
//! in-flight scan pass (spec Section 4.9).
//!
//! Single-owner state behind a `tokio::sync::Mutex`, the same shape as
//! `scheduler.rs`'s lock-guarded state. The scan driver loop in
//! `ssmd::scan` calls [`Coalescer::try_start`] on its poll tick and
//! [`Coalescer::finish`] when a pass completes; any other worker calls
//! [`Coalescer::request_scan`] to ask for a future pass. Retrying after a
//! failed scan-lock acquisition (`lockRetrySeconds`) is the scan driver's
//! concern, not this module's — the coalescer only decides *when a scan is
//! wanted*, not how the driver serializes against other processes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

/// Why a scan was requested. Producers beyond the first win only in that
/// the latest reason is the one reported to the scan driver; the coalescer
/// itself still runs at most one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanReason {
    Periodic,
    NewSource,
    NewManga,
    NewChapter,
    OverrideChange,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Scheduled,
    Running,
}

struct State {
    status: Status,
    pending: bool,
    latest_reason: Option<ScanReason>,
    last_scan_start: Option<DateTime<Utc>>,
}

pub struct Coalescer {
    state: Mutex<State>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                status: Status::Idle,
                pending: false,
                latest_reason: None,
                last_scan_start: None,
            }),
        }
    }

    /// `RequestScan(reason)`. If idle, becomes scheduled; if already
    /// running, sets the pending flag so a follow-up pass starts once the
    /// current one finishes and `minInterval` has elapsed.
    pub async fn request_scan(&self, reason: ScanReason) {
        let mut state = self.state.lock().await;
        state.latest_reason = Some(reason);
        match state.status {
            Status::Idle => state.status = Status::Scheduled,
            Status::Scheduled => {}
            Status::Running => state.pending = true,
        }
    }

    /// Called by the scan driver's poll loop. Returns the reason to scan
    /// for and transitions to `Running` if a scan is due: `Scheduled` and
    /// either no prior scan or `minInterval` has elapsed since the last
    /// one started. Returns `None` if idle, already running, or scheduled
    /// but still within `minInterval` of the last scan.
    pub async fn try_start(&self, min_interval: ChronoDuration) -> Option<ScanReason> {
        let mut state = self.state.lock().await;
        if state.status != Status::Scheduled {
            return None;
        }

        let now = Utc::now();
        if let Some(last_start) = state.last_scan_start {
            if now - last_start < min_interval {
                return None;
            }
        }

        state.status = Status::Running;
        state.last_scan_start = Some(now);
        state.pending = false;
        state.latest_reason
    }

    /// Called by the scan driver when a pass completes. If another request
    /// arrived mid-scan, schedules the next pass; otherwise goes idle.
    pub async fn finish(&self) {
        let mut state = self.state.lock().await;
        state.status = if state.pending { Status::Scheduled } else { Status::Idle };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_request_becomes_schedulable_immediately() {
        let coalescer = Coalescer::new();
        coalescer.request_scan(ScanReason::Periodic).await;
        let reason = coalescer.try_start(ChronoDuration::seconds(0)).await;
        assert_eq!(reason, Some(ScanReason::Periodic));
    }

    #[tokio::test]
    async fn try_start_with_nothing_requested_is_none() {
        let coalescer = Coalescer::new();
        assert_eq!(coalescer.try_start(ChronoDuration::seconds(0)).await, None);
    }

    #[tokio::test]
    async fn request_while_running_sets_pending_and_reschedules_on_finish() {
        let coalescer = Coalescer::new();
        coalescer.request_scan(ScanReason::Periodic).await;
        coalescer.try_start(ChronoDuration::seconds(0)).await;

        coalescer.request_scan(ScanReason::NewChapter).await;
        // still running: a second try_start must not start concurrently
        assert_eq!(coalescer.try_start(ChronoDuration::seconds(0)).await, None);

        coalescer.finish().await;
        let reason = coalescer.try_start(ChronoDuration::seconds(0)).await;
        assert_eq!(reason, Some(ScanReason::NewChapter));
    }

    #[tokio::test]
    async fn finish_without_pending_goes_idle() {
        let coalescer = Coalescer::new();
        coalescer.request_scan(ScanReason::Manual).await;
        coalescer.try_start(ChronoDuration::seconds(0)).await;
        coalescer.finish().await;
        assert_eq!(coalescer.try_start(ChronoDuration::seconds(0)).await, None);
    }

    #[tokio::test]
    async fn scheduled_scan_waits_for_min_interval_since_last_start() {
        let coalescer = Coalescer::new();
        coalescer.request_scan(ScanReason::Periodic).await;
        coalescer.try_start(ChronoDuration::seconds(0)).await;
        coalescer.finish().await;

        coalescer.request_scan(ScanReason::Periodic).await;
        let reason = coalescer.try_start(ChronoDuration::seconds(3600)).await;
        assert_eq!(reason, None, "must wait out minInterval before the next pass");
    }
}
