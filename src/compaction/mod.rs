//! # Compaction control plane
//!
//! Tracks writer activity per namespace, groups small append files into
//! time-windowed merge units, decides when a window is ready for
//! dispatch, and surfaces health. The control plane **observes and
//! schedules** — it never performs merges itself and never blocks
//! writer admission.
//!
//! ## Window lifecycle
//!
//! ```text
//!          append             interval closed + all          merge
//!          activity           active writers acked           finished
//!   (new) ────────► Pending ─────────────────────► Dispatched ───► Complete
//!                      │        or max-wait bound        │    ▲
//!                      │                                 ▼    │
//!                      │                            Processing ┘
//!                      │                                 │
//!                      │          stuck timeout          ▼
//!                      └──────── (after dispatch) ──► Stuck ──(admin reset)──► Pending
//! ```
//!
//! Transitions are monotonic; the only way out of `Stuck` is the
//! administrative [`CompactionScheduler::reset_stuck`].
//!
//! ## Dispatch lane
//!
//! Eligible windows are pushed as [`WindowDispatch`] messages onto an
//! unbounded crossbeam channel handed out at construction. The merge
//! worker drains the channel at its own pace; a slow worker never
//! back-pressures the write path.
//!
//! ## Health
//!
//! [`evaluate_health`] maps a [`CompactionMetrics`] snapshot to
//! [`Health`] with short-circuit severity (`unhealthy > degraded >
//! healthy`); thresholds come from [`DashboardConfig`].
//! [`aggregate_health`] folds per-namespace verdicts to the worst.
//!
//! The scheduler takes explicit `now_ms` timestamps rather than reading
//! a clock, keeping window arithmetic deterministic under test.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, info, warn};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised by explicit window-state operations. The scheduling
/// hot path (`record_append`, `tick`) never returns these.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The referenced window does not exist.
    #[error("unknown compaction window starting at {0} ms")]
    UnknownWindow(i64),

    /// The requested transition would move a window backwards.
    #[error("invalid window transition {from} → {to}")]
    InvalidTransition {
        /// Current state.
        from: WindowState,
        /// Requested state.
        to: WindowState,
    },

    /// The window is stuck; only an administrative reset may touch it.
    #[error("compaction window starting at {0} ms is stuck")]
    WindowStuck(i64),
}

// ------------------------------------------------------------------------------------------------
// Window model
// ------------------------------------------------------------------------------------------------

/// State of a compaction window. Ordered by lifecycle progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Accumulating append files; not yet handed to a merge worker.
    Pending,
    /// Handed to the merge lane, waiting to be picked up.
    Dispatched,
    /// A merge worker acknowledged and is processing.
    Processing,
    /// Dispatched but missed the stuck timeout; needs intervention.
    Stuck,
    /// Merge finished; terminal.
    Complete,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WindowState::Pending => "pending",
            WindowState::Dispatched => "dispatched",
            WindowState::Processing => "processing",
            WindowState::Stuck => "stuck",
            WindowState::Complete => "complete",
        })
    }
}

/// One half-open time window `[start, start + duration)` of append
/// activity awaiting merge.
#[derive(Debug, Clone)]
pub struct CompactionWindow {
    /// Window start, epoch millis.
    pub start_ms: i64,
    /// Window length, millis.
    pub duration_ms: i64,
    /// Current lifecycle state.
    pub state: WindowState,
    /// Writers that contributed files to this window.
    pub writers: BTreeSet<String>,
    /// Writers that acknowledged they are done with this window.
    pub acks: BTreeSet<String>,
    /// Append files awaiting merge.
    pub files_pending: u64,
    /// Byte weight of the pending files.
    pub bytes_pending: u64,
    /// Instant the window was first observed.
    pub created_at_ms: i64,
    /// Instant the window was dispatched, once it is.
    pub dispatched_at_ms: Option<i64>,
}

impl CompactionWindow {
    /// Exclusive end of the window interval.
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms
    }
}

/// Message sent on the dispatch lane when a window becomes eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDispatch {
    /// Namespace the window belongs to.
    pub namespace: String,
    /// Window start, epoch millis.
    pub window_start_ms: i64,
    /// Files to merge.
    pub files: u64,
    /// Byte weight of the merge input.
    pub bytes: u64,
    /// Contributing writers.
    pub writers: Vec<String>,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Scheduler timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Window length.
    pub window_duration_ms: i64,
    /// Dispatch a closed window at this age even without full acks.
    pub max_wait_ms: i64,
    /// A dispatched window older than this is marked stuck.
    pub stuck_timeout_ms: i64,
    /// Writers silent for longer than this stop counting as active.
    pub writer_expiry_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: 60_000,
            max_wait_ms: 5 * 60_000,
            stuck_timeout_ms: 10 * 60_000,
            writer_expiry_ms: 2 * 60_000,
        }
    }
}

/// Health thresholds, overridable per deployment.
#[derive(Debug, Clone, Copy)]
pub struct DashboardConfig {
    /// Pending-window count at which the namespace is unhealthy.
    pub pending_unhealthy: u64,
    /// Pending-window count at which the namespace is degraded.
    pub pending_degraded: u64,
    /// Oldest-window age at which the namespace is unhealthy.
    pub age_unhealthy_ms: i64,
    /// Oldest-window age at which the namespace is degraded.
    pub age_degraded_ms: i64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            pending_unhealthy: 50,
            pending_degraded: 10,
            age_unhealthy_ms: 6 * 60 * 60 * 1000,
            age_degraded_ms: 2 * 60 * 60 * 1000,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Metrics and health
// ------------------------------------------------------------------------------------------------

/// Point-in-time snapshot of one namespace's compaction state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionMetrics {
    pub windows_pending: u64,
    pub windows_processing: u64,
    pub windows_dispatched: u64,
    pub files_pending: u64,
    pub oldest_window_age_ms: i64,
    pub known_writers: u64,
    pub active_writers: u64,
    pub bytes_pending: u64,
    pub windows_stuck: u64,
    /// Snapshot instant, epoch millis.
    pub timestamp: i64,
}

/// Namespace health verdict. `Ord` ranks by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unhealthy => "unhealthy",
        })
    }
}

/// Maps a metrics snapshot to a health verdict.
///
/// Evaluation short-circuits from worst to best: any stuck window, 50+
/// pending windows, or a 6h-old window is unhealthy; 10+ pending or a
/// 2h-old window is degraded; everything else is healthy (default
/// thresholds).
pub fn evaluate_health(metrics: &CompactionMetrics, config: &DashboardConfig) -> Health {
    if metrics.windows_stuck > 0
        || metrics.windows_pending >= config.pending_unhealthy
        || metrics.oldest_window_age_ms >= config.age_unhealthy_ms
    {
        return Health::Unhealthy;
    }
    if metrics.windows_pending >= config.pending_degraded
        || metrics.oldest_window_age_ms >= config.age_degraded_ms
    {
        return Health::Degraded;
    }
    Health::Healthy
}

/// Worst verdict across namespaces; an empty set is healthy.
pub fn aggregate_health(verdicts: impl IntoIterator<Item = Health>) -> Health {
    verdicts.into_iter().max().unwrap_or(Health::Healthy)
}

// ------------------------------------------------------------------------------------------------
// Scheduler
// ------------------------------------------------------------------------------------------------

/// Per-namespace window scheduler.
pub struct CompactionScheduler {
    namespace: String,
    config: SchedulerConfig,
    windows: BTreeMap<i64, CompactionWindow>,
    /// writer id → last heartbeat, epoch millis.
    writers: HashMap<String, i64>,
    dispatch_tx: Sender<WindowDispatch>,
}

impl CompactionScheduler {
    /// Creates a scheduler and the receiving end of its dispatch lane.
    pub fn new(namespace: &str, config: SchedulerConfig) -> (Self, Receiver<WindowDispatch>) {
        let (dispatch_tx, dispatch_rx) = unbounded();
        (
            Self {
                namespace: namespace.to_string(),
                config,
                windows: BTreeMap::new(),
                writers: HashMap::new(),
                dispatch_tx,
            },
            dispatch_rx,
        )
    }

    /// Namespace this scheduler watches.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Registers a writer (or refreshes its heartbeat).
    pub fn register_writer(&mut self, writer: &str, now_ms: i64) {
        self.writers.insert(writer.to_string(), now_ms);
    }

    /// Heartbeat: the writer is alive and may still produce appends.
    pub fn heartbeat(&mut self, writer: &str, now_ms: i64) {
        self.writers.insert(writer.to_string(), now_ms);
    }

    /// Records one append file landing in the window containing
    /// `now_ms`. Creates the window on first activity in its interval.
    pub fn record_append(&mut self, writer: &str, now_ms: i64, bytes: u64) {
        self.heartbeat(writer, now_ms);
        let start_ms = now_ms - now_ms.rem_euclid(self.config.window_duration_ms);
        let window = self
            .windows
            .entry(start_ms)
            .or_insert_with(|| CompactionWindow {
                start_ms,
                duration_ms: self.config.window_duration_ms,
                state: WindowState::Pending,
                writers: BTreeSet::new(),
                acks: BTreeSet::new(),
                files_pending: 0,
                bytes_pending: 0,
                created_at_ms: now_ms,
                dispatched_at_ms: None,
            });
        window.writers.insert(writer.to_string());
        // A writer appending again retracts its earlier acknowledgment.
        window.acks.remove(writer);
        window.files_pending += 1;
        window.bytes_pending += bytes;
    }

    /// A writer acknowledges it will not append to the window anymore.
    pub fn acknowledge(&mut self, writer: &str, window_start_ms: i64, now_ms: i64) {
        self.heartbeat(writer, now_ms);
        if let Some(window) = self.windows.get_mut(&window_start_ms) {
            window.acks.insert(writer.to_string());
        }
    }

    /// Drives the scheduler: dispatches eligible windows and marks
    /// overdue dispatches stuck. Called from the compaction lane, never
    /// from the write path.
    pub fn tick(&mut self, now_ms: i64) {
        let active: BTreeSet<&str> = self
            .writers
            .iter()
            .filter(|&(_, &seen)| now_ms - seen <= self.config.writer_expiry_ms)
            .map(|(id, _)| id.as_str())
            .collect();

        let mut dispatches = Vec::new();
        for window in self.windows.values_mut() {
            match window.state {
                WindowState::Pending => {
                    if now_ms < window.end_ms() {
                        continue;
                    }
                    let all_acked = active.iter().all(|writer| window.acks.contains(*writer));
                    let overdue = now_ms - window.end_ms() >= self.config.max_wait_ms;
                    if all_acked || overdue {
                        window.state = WindowState::Dispatched;
                        window.dispatched_at_ms = Some(now_ms);
                        info!(
                            namespace = %self.namespace,
                            window_start_ms = window.start_ms,
                            files = window.files_pending,
                            bytes = window.bytes_pending,
                            overdue,
                            "window dispatched"
                        );
                        dispatches.push(WindowDispatch {
                            namespace: self.namespace.clone(),
                            window_start_ms: window.start_ms,
                            files: window.files_pending,
                            bytes: window.bytes_pending,
                            writers: window.writers.iter().cloned().collect(),
                        });
                    }
                }
                WindowState::Dispatched | WindowState::Processing => {
                    if let Some(dispatched_at) = window.dispatched_at_ms
                        && now_ms - dispatched_at >= self.config.stuck_timeout_ms
                    {
                        window.state = WindowState::Stuck;
                        warn!(
                            namespace = %self.namespace,
                            window_start_ms = window.start_ms,
                            stalled_ms = now_ms - dispatched_at,
                            "window stuck"
                        );
                    }
                }
                WindowState::Stuck | WindowState::Complete => {}
            }
        }

        for dispatch in dispatches {
            // A send only fails when the merge lane dropped its
            // receiver; the window stays Dispatched and the stuck
            // timeout will catch it.
            if self.dispatch_tx.send(dispatch).is_err() {
                warn!(namespace = %self.namespace, "dispatch lane receiver is gone");
            }
        }
    }

    /// A merge worker picked the window up.
    pub fn mark_processing(&mut self, window_start_ms: i64) -> Result<(), CompactionError> {
        self.transition(window_start_ms, WindowState::Processing)
    }

    /// The merge finished; the window is terminal.
    pub fn mark_complete(&mut self, window_start_ms: i64) -> Result<(), CompactionError> {
        self.transition(window_start_ms, WindowState::Complete)?;
        if let Some(window) = self.windows.get_mut(&window_start_ms) {
            window.files_pending = 0;
            window.bytes_pending = 0;
        }
        Ok(())
    }

    /// Administrative reset: the only path out of `Stuck`. The window
    /// returns to `Pending` and will be re-dispatched.
    pub fn reset_stuck(&mut self, window_start_ms: i64) -> Result<(), CompactionError> {
        let window = self
            .windows
            .get_mut(&window_start_ms)
            .ok_or(CompactionError::UnknownWindow(window_start_ms))?;
        if window.state != WindowState::Stuck {
            return Err(CompactionError::InvalidTransition {
                from: window.state,
                to: WindowState::Pending,
            });
        }
        info!(
            namespace = %self.namespace,
            window_start_ms,
            "stuck window administratively reset"
        );
        window.state = WindowState::Pending;
        window.dispatched_at_ms = None;
        Ok(())
    }

    /// Drops completed windows from the tracking map.
    pub fn prune_complete(&mut self) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.state != WindowState::Complete);
        before - self.windows.len()
    }

    /// Read-only view of a window.
    pub fn window(&self, window_start_ms: i64) -> Option<&CompactionWindow> {
        self.windows.get(&window_start_ms)
    }

    /// Metrics snapshot at `now_ms`.
    pub fn metrics(&self, now_ms: i64) -> CompactionMetrics {
        let mut metrics = CompactionMetrics {
            timestamp: now_ms,
            known_writers: self.writers.len() as u64,
            ..Default::default()
        };
        metrics.active_writers = self
            .writers
            .values()
            .filter(|&&seen| now_ms - seen <= self.config.writer_expiry_ms)
            .count() as u64;

        let mut oldest_open: Option<i64> = None;
        for window in self.windows.values() {
            match window.state {
                WindowState::Pending => metrics.windows_pending += 1,
                WindowState::Dispatched => metrics.windows_dispatched += 1,
                WindowState::Processing => metrics.windows_processing += 1,
                WindowState::Stuck => metrics.windows_stuck += 1,
                WindowState::Complete => continue,
            }
            metrics.files_pending += window.files_pending;
            metrics.bytes_pending += window.bytes_pending;
            oldest_open = Some(match oldest_open {
                Some(oldest) => oldest.min(window.created_at_ms),
                None => window.created_at_ms,
            });
        }
        metrics.oldest_window_age_ms = oldest_open.map_or(0, |created| now_ms - created);
        metrics
    }

    /// Health of this namespace at `now_ms`.
    pub fn health(&self, now_ms: i64, config: &DashboardConfig) -> Health {
        evaluate_health(&self.metrics(now_ms), config)
    }

    /// Monotonic transition helper. `Stuck` is only reachable via
    /// `tick` and only leavable via [`CompactionScheduler::reset_stuck`].
    fn transition(&mut self, window_start_ms: i64, to: WindowState) -> Result<(), CompactionError> {
        let window = self
            .windows
            .get_mut(&window_start_ms)
            .ok_or(CompactionError::UnknownWindow(window_start_ms))?;
        if window.state == WindowState::Stuck {
            return Err(CompactionError::WindowStuck(window_start_ms));
        }
        let allowed = matches!(
            (window.state, to),
            (WindowState::Dispatched, WindowState::Processing)
                | (WindowState::Dispatched, WindowState::Complete)
                | (WindowState::Processing, WindowState::Complete)
        );
        if !allowed {
            return Err(CompactionError::InvalidTransition {
                from: window.state,
                to,
            });
        }
        debug!(
            namespace = %self.namespace,
            window_start_ms,
            from = %window.state,
            to = %to,
            "window transition"
        );
        window.state = to;
        Ok(())
    }
}
