// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pure workload-prediction arithmetic over a [`ManagerState`] snapshot.
//!
//! Nothing in this module performs I/O or holds `self`; every function
//! takes a state reference and `now` explicitly so it can be tested
//! without a clock or a runtime.

use crate::job::{JobKind, MIN_WORKLOAD_SECONDS};
use crate::manager::ManagerState;
use std::time::Instant;

/// Seconds of predicted work remaining on the job currently assigned
/// to the Worker, clamped to zero once its prediction has elapsed.
pub fn workload_on_worker_seconds(state: &ManagerState, now: Instant) -> f64 {
    match state.worker_current_job_started_at {
        Some(started_at) => {
            let elapsed = now.saturating_duration_since(started_at).as_secs_f64();
            (state.worker_current_job_cost_prediction_seconds - elapsed).max(0.0)
        }
        None => 0.0,
    }
}

/// Sum of every queued job's predicted cost plus the residual on the
/// job currently running on the Worker.
pub fn total_workload_seconds(state: &ManagerState, now: Instant) -> f64 {
    let queued: f64 = state.jobs.iter().map(JobKind::cost_prediction_seconds).sum();
    queued + workload_on_worker_seconds(state, now)
}

/// True once the total predicted workload has dropped to or below
/// [`MIN_WORKLOAD_SECONDS`], the trigger for a new prefetch.
pub fn low_workload(state: &ManagerState, now: Instant) -> bool {
    total_workload_seconds(state, now) <= MIN_WORKLOAD_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, TestJob};
    use chrono::Utc;

    fn test_job(cost: f64) -> Job {
        Job::Test(TestJob {
            id: "1".into(),
            test_run_id: 1,
            commit_sha: "deadbeef".into(),
            cost_prediction_seconds: cost,
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

    /// S3 Workload sum.
    #[test]
    fn workload_sum_clamps_stale_worker_residual() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.worker_current_job_cost_prediction_seconds = 1.0;
        // A start time far enough in the past that the prediction has
        // long since elapsed, forcing the clamp to 0.
        state.worker_current_job_started_at = Some(now - std::time::Duration::from_secs(3600));
        state.jobs.push_back(test_job(2.0));
        state.jobs.push_back(test_job(10.0));
        state.jobs.push_back(test_job(100.0));

        assert_eq!(total_workload_seconds(&state, now), 112.0);
    }

    /// S4 LowWorkload trigger.
    #[test]
    fn low_workload_triggers_under_threshold() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.worker_current_job_cost_prediction_seconds = 1.0;
        state.worker_current_job_started_at = Some(now - std::time::Duration::from_secs(3600));
        state.jobs.push_back(test_job(1.0));
        state.jobs.push_back(test_job(2.0));
        state.jobs.push_back(test_job(3.0));

        assert!(low_workload(&state, now));
    }

    #[test]
    fn sentinel_prediction_defeats_low_workload() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.jobs.push_back(test_job(crate::job::NO_PREDICTION_WORKLOAD_SECONDS));

        assert!(!low_workload(&state, now));
    }

    #[test]
    fn workload_never_negative() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.worker_current_job_cost_prediction_seconds = 5.0;
        state.worker_current_job_started_at = Some(now);

        assert!(workload_on_worker_seconds(&state, now) >= 0.0);
        assert!(total_workload_seconds(&state, now) >= 0.0);
    }
}
