use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{render_entries, ResultAggregator};
use crate::probe::{ProbeExecutor, DEFAULT_DEADLINE};
use crate::types::{Descriptor, ProbeResult, Progress, WorkingEntry};

/// Probes dispatched together before the scheduler advances.
pub const DEFAULT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Maximum number of probes in flight.
    pub window: usize,
    /// Hard deadline per probe.
    pub deadline: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Counters and ranked results of one run. Owned and mutated only by the
/// task driving [`run_batch`].
#[derive(Debug, Clone, Default)]
pub struct RunState {
    total: u64,
    completed: u64,
    skipped: u64,
    working: ResultAggregator,
}

impl RunState {
    pub fn new(total: u64, skipped: u64) -> Self {
        Self {
            total,
            skipped,
            ..Self::default()
        }
    }

    fn record(&mut self, descriptor: Option<&Descriptor>, result: ProbeResult) {
        self.completed += 1;
        if let (Some(d), ProbeResult::Working { latency_ms }) = (descriptor, result) {
            self.working.push(d.original(), latency_ms);
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            total: self.total,
            completed: self.completed,
            working: self.working.len() as u64,
            skipped: self.skipped,
        }
    }

    pub fn entries(&self) -> &[WorkingEntry] {
        self.working.entries()
    }
}

/// Notifications emitted by [`run_batch`] as the run progresses.
#[derive(Debug)]
pub enum RunEvent<'a> {
    /// One probe resolved. `descriptor` is `None` if the probe task itself died.
    ProbeFinished {
        descriptor: Option<&'a Descriptor>,
        result: ProbeResult,
        progress: Progress,
        entries: &'a [WorkingEntry],
    },
    /// Emitted exactly once, after the last window or on cancellation.
    Finished { progress: Progress, cancelled: bool },
}

/// Final outcome of a run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    #[serde(flatten)]
    pub progress: Progress,
    pub cancelled: bool,
    pub entries: Vec<WorkingEntry>,
}

impl RunReport {
    pub fn render(&self) -> String {
        render_entries(&self.entries)
    }

    /// One-line outcome for the user.
    pub fn summary(&self) -> String {
        if self.cancelled {
            format!("Run cancelled. Found {} working proxies.", self.entries.len())
        } else if self.entries.is_empty() {
            "No working proxies found.".to_string()
        } else {
            format!("Found {} working proxies!", self.entries.len())
        }
    }
}

/// Probe `descriptors` in consecutive windows of `window` probes.
///
/// - Every probe of a window runs concurrently on a `JoinSet`.
/// - The next window is spawned only once the current one has fully drained.
/// - Each completion updates the run state and is reported through `on_event`.
/// - Cancelling `cancel` aborts in-flight probes and skips remaining windows.
pub async fn run_batch<F>(
    descriptors: Vec<Descriptor>,
    skipped: usize,
    executor: &ProbeExecutor,
    window: usize,
    cancel: CancellationToken,
    mut on_event: F,
) -> RunReport
where
    F: FnMut(RunEvent<'_>),
{
    let window = window.max(1);
    let mut state = RunState::new(descriptors.len() as u64, skipped as u64);
    let mut cancelled = false;

    'windows: for chunk in descriptors.chunks(window) {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let mut set = JoinSet::new();
        for (idx, descriptor) in chunk.iter().enumerate() {
            let executor = executor.clone();
            let target = descriptor.target().clone();
            set.spawn(async move { (idx, executor.probe(&target).await) });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    set.shutdown().await;
                    cancelled = true;
                    break 'windows;
                }
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    let (descriptor, result) = match joined {
                        Ok((idx, result)) => (Some(&chunk[idx]), result),
                        Err(e) => {
                            warn!(error = %e, "probe task failed");
                            (None, ProbeResult::Failed)
                        }
                    };
                    state.record(descriptor, result);
                    if let (Some(d), ProbeResult::Working { latency_ms }) = (descriptor, result) {
                        info!("SUCCESS: {} ({}ms)", d.server(), latency_ms);
                    }
                    on_event(RunEvent::ProbeFinished {
                        descriptor,
                        result,
                        progress: state.progress(),
                        entries: state.entries(),
                    });
                }
            }
        }
    }

    let progress = state.progress();
    on_event(RunEvent::Finished {
        progress,
        cancelled,
    });
    info!(
        total = progress.total,
        completed = progress.completed,
        working = progress.working,
        cancelled,
        "run finished"
    );

    RunReport {
        progress,
        cancelled,
        entries: state.working.into_entries(),
    }
}
