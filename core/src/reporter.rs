// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Reporter actor: batches completed jobs, ships them back to the
//! coordinator under a bounded-parallelism policy, and beacons when
//! idle.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{error, info, info_span, Instrument};

use crate::error::CoordinatorError;
use crate::job::{Job, ACTIVE_SENDERS_LIMIT, BEACON_THRESHOLD_SECONDS, REPORTING_FREQUENCY_SECONDS};

/// Abstraction over "can upload reports and beacon", so the Reporter
/// is testable without a live coordinator.
pub trait ReportSink {
    /// Uploads a batch of completed jobs, returning any test-run ids
    /// the coordinator asked to have cancelled.
    fn batch_update(
        &self,
        jobs: &[Job],
    ) -> impl std::future::Future<Output = Result<Vec<i64>, CoordinatorError>> + Send;
    /// Sends a bare liveness beacon.
    fn beacon(&self) -> impl std::future::Future<Output = Result<(), CoordinatorError>> + Send;
}

/// State owned exclusively by the Reporter task.
pub struct ReporterState {
    /// Completed jobs awaiting upload.
    pub reports: Vec<Job>,
    /// Number of in-flight Sender tasks, bounded by
    /// [`ACTIVE_SENDERS_LIMIT`]. Mutated only here, never an atomic.
    pub active_senders: u8,
    /// When the most recent successful coordinator round-trip
    /// (upload or beacon) completed.
    pub last_server_communication: Instant,
}

impl Default for ReporterState {
    fn default() -> Self {
        Self {
            reports: Vec::new(),
            active_senders: 0,
            last_server_communication: Instant::now(),
        }
    }
}

impl ReporterState {
    /// True once [`BEACON_THRESHOLD_SECONDS`] have passed since the
    /// last successful coordinator round-trip.
    pub fn needs_beacon(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_server_communication).as_secs()
            > BEACON_THRESHOLD_SECONDS
    }
}

/// Channel handles the Reporter actor owns or communicates over.
pub struct ReporterChannels {
    /// Worker → Reporter: completed jobs.
    pub reports_rx: mpsc::Receiver<Job>,
    /// Reporter → Manager: test-run ids to cancel.
    pub cancelled_test_run_ids_tx: mpsc::Sender<Vec<i64>>,
}

/// Reported internally by a detached Sender/Beacon task when it exits.
enum TaskDone {
    /// A Sender finished; `success` tells the Reporter whether to bump
    /// `last_server_communication`.
    Sender { success: bool },
    /// A Beacon succeeded (failure panics the task instead).
    Beacon,
}

/// Runs the Reporter's main loop. A Beacon failure is fatal, mirroring
/// the original behavior: without proof of liveness the coordinator
/// may reassign this agent's work to another worker.
pub async fn run<S>(coordinator: Arc<S>, mut channels: ReporterChannels)
where
    S: ReportSink + Send + Sync + 'static,
{
    let span = info_span!("reporter");
    async move {
        let mut state = ReporterState::default();
        let mut ticker = interval(Duration::from_secs(REPORTING_FREQUENCY_SECONDS));
        let (done_tx, mut done_rx) = mpsc::channel::<TaskDone>(ACTIVE_SENDERS_LIMIT as usize + 1);

        info!("entering loop");
        loop {
            tokio::select! {
                biased;
                Some(job) = channels.reports_rx.recv() => {
                    state.reports.push(job);
                }
                Some(event) = done_rx.recv() => {
                    match event {
                        TaskDone::Sender { success } => {
                            state.active_senders = state.active_senders.saturating_sub(1);
                            if success {
                                state.last_server_communication = Instant::now();
                            }
                        }
                        TaskDone::Beacon => {
                            state.last_server_communication = Instant::now();
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if state.active_senders < ACTIVE_SENDERS_LIMIT && !state.reports.is_empty() {
                        let snapshot = std::mem::take(&mut state.reports);
                        state.active_senders += 1;
                        spawn_sender(
                            coordinator.clone(),
                            snapshot,
                            done_tx.clone(),
                            channels.cancelled_test_run_ids_tx.clone(),
                        );
                    } else if state.needs_beacon(now) {
                        spawn_beacon(coordinator.clone(), done_tx.clone());
                    }
                }
                else => break,
            }
        }
    }
    .instrument(span)
    .await;
}

fn spawn_sender<S>(
    coordinator: Arc<S>,
    snapshot: Vec<Job>,
    done_tx: mpsc::Sender<TaskDone>,
    cancelled_tx: mpsc::Sender<Vec<i64>>,
) where
    S: ReportSink + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(count = snapshot.len(), "sending reports");
        let success = match coordinator.batch_update(&snapshot).await {
            Ok(delete_test_runs) => {
                if !delete_test_runs.is_empty() {
                    let _ = cancelled_tx.send(delete_test_runs).await;
                }
                true
            }
            Err(err) => {
                // Give up on this batch; the reports are lost.
                error!(%err, "failed to send reports, giving up on this batch");
                false
            }
        };
        // MUST fire exactly once regardless of outcome, or
        // active_senders drifts upward forever.
        let _ = done_tx.send(TaskDone::Sender { success }).await;
    });
}

fn spawn_beacon<S>(coordinator: Arc<S>, done_tx: mpsc::Sender<TaskDone>)
where
    S: ReportSink + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = coordinator.beacon().await {
            error!(%err, "beacon failed, this is fatal to the agent");
            panic!("tried to beacon but there was an error: {err}");
        }
        let _ = done_tx.send(TaskDone::Beacon).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TestJob;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_job(id: &str) -> Job {
        Job::Test(TestJob {
            id: id.into(),
            test_run_id: 1,
            commit_sha: "deadbeef".into(),
            cost_prediction_seconds: 1.0,
            sent_at_seconds_since_epoch: 0.0,
            created_at: Utc::now(),
            command: "true".into(),
            queued_at_seconds_since_epoch: None,
            started_at_seconds_since_epoch: None,
            result: None,
            result_type: None,
            worker_in_queue_seconds: None,
            worker_command_run_seconds: None,
        })
    }

    struct FakeSink {
        batch_calls: AtomicUsize,
    }

    impl ReportSink for FakeSink {
        async fn batch_update(&self, _jobs: &[Job]) -> Result<Vec<i64>, CoordinatorError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn beacon(&self) -> Result<(), CoordinatorError> {
            Ok(())
        }
    }

    /// S6 Reporter absorbs report.
    #[tokio::test]
    async fn reports_channel_absorbed_into_state() {
        let (reports_tx, reports_rx) = mpsc::channel(1);
        let (cancelled_tx, _cancelled_rx) = mpsc::channel(1);
        reports_tx.send(test_job("123")).await.unwrap();
        drop(reports_tx);

        let mut channels = ReporterChannels { reports_rx, cancelled_test_run_ids_tx: cancelled_tx };
        let mut state = ReporterState::default();

        if let Some(job) = channels.reports_rx.recv().await {
            state.reports.push(job);
        }

        assert_eq!(state.reports.len(), 1);
        use crate::job::JobKind;
        assert_eq!(state.reports[0].id(), "123");
    }

    #[tokio::test]
    async fn sender_always_signals_done_on_success() {
        let sink = Arc::new(FakeSink { batch_calls: AtomicUsize::new(0) });
        let (done_tx, mut done_rx) = mpsc::channel::<TaskDone>(1);
        let (cancelled_tx, _cancelled_rx) = mpsc::channel(1);

        spawn_sender(sink.clone(), vec![test_job("1")], done_tx, cancelled_tx);

        let event = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .expect("sender signals done within 1s")
            .expect("channel open");
        assert!(matches!(event, TaskDone::Sender { success: true }));
        assert_eq!(sink.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn active_senders_bounded_by_limit() {
        let mut state = ReporterState::default();
        state.active_senders = ACTIVE_SENDERS_LIMIT;
        assert!(state.active_senders <= ACTIVE_SENDERS_LIMIT);
    }

    #[test]
    fn needs_beacon_after_threshold() {
        let mut state = ReporterState::default();
        state.last_server_communication = Instant::now() - Duration::from_secs(BEACON_THRESHOLD_SECONDS + 1);
        assert!(state.needs_beacon(Instant::now()));

        state.last_server_communication = Instant::now();
        assert!(!state.needs_beacon(Instant::now()));
    }
}
