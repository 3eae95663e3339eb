// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Manager actor: owns the local job queue, drives the
//! prefetch/backoff loop against the coordinator, and dispatches the
//! head job to the Worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, info_span, Instrument};

use crate::coordinator::{FetchedBatch, JobSource};
use crate::job::{
    Job, JobKind, NO_JOBS_TIMEOUT_SECONDS, REMAINING_WORKLOAD_CHECK_SECONDS,
};
use crate::predictor;

/// State owned exclusively by the Manager task. No other actor ever
/// holds a reference into this; cross-actor communication happens
/// only over the channels in [`Manager`].
#[derive(Default)]
pub struct ManagerState {
    /// FIFO queue of jobs waiting for the Worker.
    pub jobs: VecDeque<Job>,
    /// Predicted cost of the job currently on the Worker, cleared to
    /// zero on the worker-idle signal.
    pub worker_current_job_cost_prediction_seconds: f64,
    /// Monotonic time the current job was handed to the Worker.
    pub worker_current_job_started_at: Option<Instant>,
}

/// Removes and returns the head of the queue, recording the
/// prediction bookkeeping the Predictor needs. Returns `None` without
/// mutating anything if the queue is empty (S1/S2).
pub fn assign_job_to_worker(state: &mut ManagerState, now: Instant) -> Option<Job> {
    let job = state.jobs.pop_front()?;
    state.worker_current_job_cost_prediction_seconds = job.cost_prediction_seconds();
    state.worker_current_job_started_at = Some(now);
    Some(job)
}

/// Removes every queued job whose `test_run_id` is in `ids`,
/// preserving the order of the survivors. A single retain pass, so no
/// duplicate-entry risk regardless of how many times an id repeats.
pub fn cancel_test_runs(state: &mut ManagerState, ids: &[i64]) {
    state
        .jobs
        .retain(|job| !ids.contains(&job.test_run_id()));
}

/// Channel handles the Manager actor owns or communicates over. The
/// FetchLoop's output (`new_jobs_chan`) is not among these: it has no
/// producer outside the Manager itself, so `run` owns that channel
/// end to end instead of exposing an external half nothing would ever
/// write to.
pub struct ManagerChannels {
    /// Manager → Worker: the head of the queue, once assigned.
    pub jobs_tx: mpsc::Sender<Job>,
    /// Worker → Manager: fires once per completed job.
    pub worker_idling_rx: mpsc::Receiver<bool>,
    /// Reporter → Manager: test-run ids to drop from the queue.
    pub cancelled_test_run_ids_rx: mpsc::Receiver<Vec<i64>>,
}

/// Runs the Manager's main loop. Never returns under normal operation;
/// a fetch error is fatal and unwinds this task, which the caller
/// treats as a process-ending condition.
pub async fn run<C>(coordinator: Arc<C>, mut channels: ManagerChannels)
where
    C: JobSource + Send + Sync + 'static,
{
    let span = info_span!("manager");
    async move {
        let mut state = ManagerState::default();
        let (new_jobs_tx, mut new_jobs_rx) = mpsc::channel::<Vec<Job>>(1);
        let (workload_tx, workload_rx) = tokio::sync::watch::channel(true);
        spawn_fetch_loop(coordinator.clone(), new_jobs_tx, workload_rx);

        info!("entering loop");
        loop {
            let now = Instant::now();
            let _ = workload_tx.send(predictor::low_workload(&state, now));
            if state.jobs.is_empty() {
                tokio::select! {
                    biased;
                    Some(jobs) = new_jobs_rx.recv() => {
                        receive_new_jobs(&mut state, jobs);
                    }
                    Some(_) = channels.worker_idling_rx.recv() => {
                        state.worker_current_job_cost_prediction_seconds = 0.0;
                    }
                    Some(ids) = channels.cancelled_test_run_ids_rx.recv() => {
                        // Queue is empty: nothing to cancel, but the
                        // Reporter must still make progress.
                        let _ = ids;
                    }
                    else => break,
                }
            } else {
                tokio::select! {
                    biased;
                    Some(jobs) = new_jobs_rx.recv() => {
                        receive_new_jobs(&mut state, jobs);
                    }
                    Some(_) = channels.worker_idling_rx.recv() => {
                        state.worker_current_job_cost_prediction_seconds = 0.0;
                    }
                    Some(ids) = channels.cancelled_test_run_ids_rx.recv() => {
                        cancel_test_runs(&mut state, &ids);
                    }
                    permit = channels.jobs_tx.reserve() => {
                        match permit {
                            Ok(permit) => {
                                if let Some(job) = assign_job_to_worker(&mut state, now) {
                                    permit.send(job);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    else => break,
                }
            }
        }
        error!("manager loop exited, all channels closed");
    }
    .instrument(span)
    .await;
}

fn receive_new_jobs(state: &mut ManagerState, mut jobs: Vec<Job>) {
    let now_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    for job in &mut jobs {
        job.set_queued_at(now_epoch);
    }
    state.jobs.extend(jobs);
}

/// Drives the FetchLoop state machine: at most one pending fetch and
/// one pending workload check at a time, alternating, realized with a
/// single reset sleep future rather than recursive task spawning.
fn spawn_fetch_loop<C>(
    coordinator: Arc<C>,
    new_jobs_tx: mpsc::Sender<Vec<Job>>,
    workload_rx: tokio::sync::watch::Receiver<bool>,
) where
    C: JobSource + Send + Sync + 'static,
{
    tokio::spawn(async move {
        enum Action {
            Fetch,
            CheckWorkload,
        }

        let mut next_action = Action::Fetch;
        loop {
            match next_action {
                Action::Fetch => match coordinator.fetch_next_batch().await {
                    Ok(FetchedBatch::Jobs(jobs)) if !jobs.is_empty() => {
                        info!(count = jobs.len(), "fetched jobs");
                        if new_jobs_tx.send(jobs).await.is_err() {
                            return;
                        }
                        sleep(Duration::from_secs(REMAINING_WORKLOAD_CHECK_SECONDS)).await;
                        next_action = Action::CheckWorkload;
                    }
                    Ok(FetchedBatch::Jobs(_)) => {
                        sleep(Duration::from_secs(NO_JOBS_TIMEOUT_SECONDS)).await;
                        next_action = Action::Fetch;
                    }
                    Ok(FetchedBatch::Setup(job)) => {
                        if new_jobs_tx.send(vec![job]).await.is_err() {
                            return;
                        }
                        sleep(Duration::from_secs(REMAINING_WORKLOAD_CHECK_SECONDS)).await;
                        next_action = Action::CheckWorkload;
                    }
                    Err(err) => {
                        error!(%err, "fetch failed, this is fatal to the manager");
                        panic!("tried to fetch jobs but there was an error: {err}");
                    }
                },
                Action::CheckWorkload => {
                    if *workload_rx.borrow() {
                        next_action = Action::Fetch;
                    } else {
                        sleep(Duration::from_secs(REMAINING_WORKLOAD_CHECK_SECONDS)).await;
                        next_action = Action::CheckWorkload;
                    }
                }
            }
        }
    });
}
