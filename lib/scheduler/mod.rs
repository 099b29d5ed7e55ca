//! Drives reconciliation cycles: one at a time, either once or on a fixed interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::logging::error_chain;
use crate::reconcile::{CycleReport, EngineError, ReconciliationEngine};
use crate::server::monitoring::RECONCILE_METRICS;
use crate::store::{SourceStore, TargetStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    RunOnce,
    /// Cycles start `interval` apart, measured from the start of the previous cycle.
    Continuous { interval: Duration },
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The cycle aborted; carries the rendered error chain.
    Failed(String),
    /// Another cycle was in progress, so this trigger did nothing.
    AlreadyRunning,
}

/// Something that can run one full reconciliation cycle.
pub trait CycleRunner: Send + Sync {
    fn run_cycle(&self) -> BoxFuture<'_, Result<CycleReport, EngineError>>;
}

impl<S, T> CycleRunner for ReconciliationEngine<S, T>
where
    S: SourceStore,
    T: TargetStore,
{
    fn run_cycle(&self) -> BoxFuture<'_, Result<CycleReport, EngineError>> {
        ReconciliationEngine::run_cycle(self).boxed()
    }
}

/// Clears the running flag when dropped, whichever way the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler<R> {
    runner: R,
    mode: ScheduleMode,
    running: AtomicBool,
}

impl<R: CycleRunner> Scheduler<R> {
    pub fn new(runner: R, mode: ScheduleMode) -> Self {
        Self {
            runner,
            mode,
            running: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one cycle unless one is already in progress. Never returns an error: failures
    /// are logged and reported as [`CycleOutcome::Failed`].
    pub async fn trigger(&self) -> CycleOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(event = "cycle_rejected", "a reconciliation cycle is already running");
            if let Some(metrics) = RECONCILE_METRICS.get() {
                metrics.cycles_rejected_total.inc();
            }
            return CycleOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);

        let started = Instant::now();
        info!(event = "cycle_started", "reconciliation cycle started");
        let result = self.runner.run_cycle().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(metrics) = RECONCILE_METRICS.get() {
            metrics.last_cycle_duration_ms.set(elapsed_ms as i64);
        }

        match result {
            Ok(report) => {
                info!(
                    event = "cycle_completed",
                    elapsed_ms,
                    writes = report.writes(),
                    "reconciliation cycle completed"
                );
                if let Some(metrics) = RECONCILE_METRICS.get() {
                    metrics.cycles_completed_total.inc();
                }
                CycleOutcome::Completed(report)
            }
            Err(err) => {
                let message = error_chain(&err);
                error!(
                    event = "cycle_failed",
                    elapsed_ms,
                    error = %message,
                    "reconciliation cycle aborted; retrying next cycle"
                );
                if let Some(metrics) = RECONCILE_METRICS.get() {
                    metrics.cycles_failed_total.inc();
                }
                CycleOutcome::Failed(message)
            }
        }
    }

    /// Runs cycles until the mode says stop or `shutdown` fires. Cancellation is only
    /// observed between cycles. Returns the number of cycles triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        let mut cycles = 0u64;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let cycle_start = Instant::now();
            self.trigger().await;
            cycles += 1;

            let ScheduleMode::Continuous { interval } = self.mode else {
                break;
            };
            let next = cycle_start + interval;
            if next <= Instant::now() {
                warn!(
                    event = "cycle_overran",
                    interval_ms = interval.as_millis() as u64,
                    "cycle took longer than the interval; starting the next one now"
                );
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
        info!(event = "scheduler_stopped", cycles, "scheduler stopped");
        cycles
    }
}
