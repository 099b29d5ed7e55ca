use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feature_sync_lib::reconcile::{CycleReport, EngineError, Side};
use feature_sync_lib::scheduler::{CycleOutcome, CycleRunner, ScheduleMode, Scheduler};
use feature_sync_lib::store::StoreError;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Blocks inside the cycle until the test releases it.
#[derive(Default)]
struct GatedRunner {
    started: Notify,
    release: Notify,
    calls: AtomicUsize,
}

impl CycleRunner for GatedRunner {
    fn run_cycle(&self) -> BoxFuture<'_, Result<CycleReport, EngineError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(CycleReport::default())
        }
        .boxed()
    }
}

/// Counts cycles; each one takes `duration` of (possibly paused) tokio time.
#[derive(Default)]
struct CountingRunner {
    calls: AtomicUsize,
    duration: Duration,
}

impl CycleRunner for CountingRunner {
    fn run_cycle(&self) -> BoxFuture<'_, Result<CycleReport, EngineError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.duration.is_zero() {
                tokio::time::sleep(self.duration).await;
            }
            Ok(CycleReport::default())
        }
        .boxed()
    }
}

struct FailingRunner;

impl CycleRunner for FailingRunner {
    fn run_cycle(&self) -> BoxFuture<'_, Result<CycleReport, EngineError>> {
        async move {
            Err(EngineError::Status {
                side: Side::Target,
                source: StoreError::Connection("edge server unreachable".to_string()),
            })
        }
        .boxed()
    }
}

#[tokio::test]
async fn overlapping_trigger_is_rejected() {
    let scheduler = Arc::new(Scheduler::new(GatedRunner::default(), ScheduleMode::RunOnce));

    let first = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.trigger().await }
    });
    scheduler.runner().started.notified().await;
    assert!(scheduler.is_running());

    assert!(matches!(
        scheduler.trigger().await,
        CycleOutcome::AlreadyRunning
    ));

    scheduler.runner().release.notify_one();
    let outcome = first.await.expect("first trigger task panicked");
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.runner().calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_cycle_releases_the_running_flag() {
    let scheduler = Scheduler::new(FailingRunner, ScheduleMode::RunOnce);

    match scheduler.trigger().await {
        CycleOutcome::Failed(message) => {
            assert!(message.contains("edge server unreachable"), "{message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!scheduler.is_running());
    assert!(matches!(scheduler.trigger().await, CycleOutcome::Failed(_)));
}

#[tokio::test]
async fn run_once_runs_a_single_cycle() {
    let scheduler = Scheduler::new(CountingRunner::default(), ScheduleMode::RunOnce);

    let cycles = scheduler.run(CancellationToken::new()).await;
    assert_eq!(cycles, 1);
    assert_eq!(scheduler.runner().calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_token_prevents_any_cycle() {
    let scheduler = Scheduler::new(
        CountingRunner::default(),
        ScheduleMode::Continuous {
            interval: Duration::from_secs(10),
        },
    );
    let token = CancellationToken::new();
    token.cancel();

    assert_eq!(scheduler.run(token).await, 0);
    assert_eq!(scheduler.runner().calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn continuous_mode_starts_cycles_on_the_interval() {
    let scheduler = Arc::new(Scheduler::new(
        CountingRunner::default(),
        ScheduleMode::Continuous {
            interval: Duration::from_secs(10),
        },
    ));
    let token = CancellationToken::new();

    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let token = token.clone();
        async move { scheduler.run(token).await }
    });

    tokio::time::sleep(Duration::from_secs(25)).await;
    token.cancel();

    let cycles = handle.await.expect("scheduler task panicked");
    assert_eq!(cycles, 3);
    assert_eq!(scheduler.runner().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn overrunning_cycles_start_back_to_back() {
    let scheduler = Arc::new(Scheduler::new(
        CountingRunner {
            calls: AtomicUsize::new(0),
            duration: Duration::from_secs(15),
        },
        ScheduleMode::Continuous {
            interval: Duration::from_secs(10),
        },
    ));
    let token = CancellationToken::new();

    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let token = token.clone();
        async move { scheduler.run(token).await }
    });

    // Cycles start at 0s, 15s and 30s; the one in flight at 35s is allowed to finish.
    tokio::time::sleep(Duration::from_secs(35)).await;
    token.cancel();

    let cycles = handle.await.expect("scheduler task panicked");
    assert_eq!(cycles, 3);
}
