// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Worker actor: executes jobs one at a time, preparing the
//! working tree whenever the test-run identity changes.

use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

use crate::job::{Job, JobKind, ResultType};
use crate::process::CommandRunner;
use crate::vcs::ProjectEnvironment;

/// State owned exclusively by the Worker task.
#[derive(Default)]
pub struct WorkerState {
    last_test_run_id: Option<i64>,
}

/// Channel handles the Worker actor owns or communicates over.
pub struct WorkerChannels {
    /// Manager → Worker: the next job to run.
    pub jobs_rx: mpsc::Receiver<Job>,
    /// Worker → Manager: fires once per completed job.
    pub worker_idling_tx: mpsc::Sender<bool>,
    /// Worker → Reporter: completed jobs, sent via a detached
    /// forwarder so the Worker never blocks on it.
    pub reports_tx: mpsc::Sender<Job>,
}

/// Runs the Worker's main loop: receive, prepare the environment if
/// needed, run the command, signal idle, forward the report.
pub async fn run<E, R>(environment: E, runner: R, mut channels: WorkerChannels)
where
    E: ProjectEnvironment + Send + Sync + 'static,
    R: CommandRunner + Send + Sync + 'static,
{
    let span = info_span!("worker");
    async move {
        let mut state = WorkerState::default();
        info!("entering loop");
        while let Some(job) = channels.jobs_rx.recv().await {
            let job = run_job(&environment, &runner, &mut state, job).await;

            if channels.worker_idling_tx.send(true).await.is_err() {
                break;
            }

            let reports_tx = channels.reports_tx.clone();
            tokio::spawn(async move {
                let _ = reports_tx.send(job).await;
            });
        }
    }
    .instrument(span)
    .await;
}

/// Runs a single job to completion, mirroring the RunJob contract:
/// environment setup on test-run change, command execution, result
/// classification, and timing bookkeeping.
async fn run_job<E, R>(environment: &E, runner: &R, state: &mut WorkerState, mut job: Job) -> Job
where
    E: ProjectEnvironment,
    R: CommandRunner,
{
    if state.last_test_run_id != Some(job.test_run_id()) {
        if let Err(err) = environment.setup_test_environment(job.commit_sha()).await {
            // Blocks this job from running meaningfully; reported as an
            // execution error rather than crashing the Worker.
            tracing::error!(%err, "failed to prepare working tree");
            apply_outcome(&mut job, format!("environment setup failed: {err}"), ResultType::Error, 0.0, 0.0);
            state.last_test_run_id = Some(job.test_run_id());
            return job;
        }
    }

    let now_epoch = now_seconds_since_epoch();
    let queued_at = match &job {
        Job::Test(t) => t.queued_at_seconds_since_epoch,
        Job::Setup(s) => s.queued_at_seconds_since_epoch,
    }
    .unwrap_or(now_epoch);

    match &mut job {
        Job::Test(t) => {
            t.started_at_seconds_since_epoch = Some(now_epoch);
            let outcome = runner.run(&t.command).await;
            t.result = Some(outcome.combined_output);
            t.result_type = Some(outcome.result_type);
            t.worker_in_queue_seconds = Some((now_epoch - queued_at).max(0.0));
            t.worker_command_run_seconds = Some(outcome.duration.as_secs_f64().round());
        }
        Job::Setup(s) => {
            s.result = Some("setup job executed".to_string());
        }
    }

    state.last_test_run_id = Some(job.test_run_id());
    job
}

fn apply_outcome(job: &mut Job, output: String, result_type: ResultType, in_queue: f64, run: f64) {
    if let Job::Test(t) = job {
        t.result = Some(output);
        t.result_type = Some(result_type);
        t.worker_in_queue_seconds = Some(in_queue);
        t.worker_command_run_seconds = Some(run);
    }
}

fn now_seconds_since_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
