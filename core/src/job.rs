// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job data model: the unit of work the agent pulls from the
//! coordinator, runs, and reports back.
//!
//! A job is represented as a tagged enum with two variants, `Test`
//! and `Setup`, dispatching through the [`JobKind`] trait rather than
//! an inheritance hierarchy.

use serde::{Deserialize, Serialize};

/// Lower bound, in seconds, below which the Manager considers the
/// queue's predicted workload "low" and triggers a prefetch.
pub const MIN_WORKLOAD_SECONDS: f64 = 10.0;

/// Stand-in cost prediction assigned to a job when the coordinator
/// supplied none (or zero). Large enough that a single such job keeps
/// `low_workload` false for as long as it sits in the queue.
pub const NO_PREDICTION_WORKLOAD_SECONDS: f64 = 1_000_000_000.0;

/// How often the Manager re-checks workload while not actively
/// fetching, once a fetch has already topped up the queue.
pub const REMAINING_WORKLOAD_CHECK_SECONDS: u64 = 5;

/// How long the Manager waits before retrying a fetch that returned
/// zero jobs.
pub const NO_JOBS_TIMEOUT_SECONDS: u64 = 5;

/// How often the Reporter's ticker fires.
pub const REPORTING_FREQUENCY_SECONDS: u64 = 5;

/// Maximum number of concurrently in-flight Sender tasks.
pub const ACTIVE_SENDERS_LIMIT: u8 = 3;

/// Seconds of silence after which the Reporter sends a beacon.
pub const BEACON_THRESHOLD_SECONDS: u64 = 12;

/// Fixed retry interval for coordinator transport errors.
pub const REQUEST_ERROR_TIMEOUT_SECONDS: u64 = 10;

/// Classification of a finished test job's outcome. Discriminants
/// match the coordinator's wire contract bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultType {
    /// The command exited zero.
    Passed = 3,
    /// The command exited non-zero with no stderr output.
    Failed = 4,
    /// The command exited non-zero with stderr output, or failed to
    /// start at all.
    Error = 5,
}

impl Serialize for ResultType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ResultType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            3 => Ok(ResultType::Passed),
            4 => Ok(ResultType::Failed),
            5 => Ok(ResultType::Error),
            other => Err(serde::de::Error::custom(format!(
                "invalid result_type discriminant: {other}"
            ))),
        }
    }
}

/// Shared capability set every job variant implements, dispatched by
/// matching on the [`Job`] tag rather than through dynamic dispatch.
pub trait JobKind {
    /// Opaque identifier, unique per coordinator-dispatched work item.
    fn id(&self) -> &str;
    /// The test run this job belongs to.
    fn test_run_id(&self) -> i64;
    /// VCS revision the job must execute against.
    fn commit_sha(&self) -> &str;
    /// Predicted cost in seconds, already defaulted to the sentinel
    /// when the coordinator supplied none.
    fn cost_prediction_seconds(&self) -> f64;
    /// Records when the Manager placed this job on the queue.
    fn set_queued_at(&mut self, seconds_since_epoch: f64);
}

/// A unit of work dispatched by the coordinator: either a test
/// command to execute, or a one-off environment setup request.
#[derive(Debug, Clone)]
pub enum Job {
    /// Run a test command and report its classified result.
    Test(TestJob),
    /// Prepare the project's working tree / build dependencies.
    Setup(SetupJob),
}

impl Job {
    /// The job's outcome after it has been run, if any.
    pub fn result(&self) -> Option<&str> {
        match self {
            Job::Test(j) => j.result.as_deref(),
            Job::Setup(j) => j.result.as_deref(),
        }
    }
}

impl JobKind for Job {
    fn id(&self) -> &str {
        match self {
            Job::Test(j) => &j.id,
            Job::Setup(j) => &j.id,
        }
    }

    fn test_run_id(&self) -> i64 {
        match self {
            Job::Test(j) => j.test_run_id,
            Job::Setup(j) => j.test_run_id,
        }
    }

    fn commit_sha(&self) -> &str {
        match self {
            Job::Test(j) => &j.commit_sha,
            Job::Setup(j) => &j.commit_sha,
        }
    }

    fn cost_prediction_seconds(&self) -> f64 {
        match self {
            Job::Test(j) => j.cost_prediction_seconds,
            Job::Setup(j) => j.cost_prediction_seconds,
        }
    }

    fn set_queued_at(&mut self, seconds_since_epoch: f64) {
        match self {
            Job::Test(j) => j.queued_at_seconds_since_epoch = Some(seconds_since_epoch),
            Job::Setup(j) => j.queued_at_seconds_since_epoch = Some(seconds_since_epoch),
        }
    }
}

/// A single test command dispatched by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestJob {
    /// Opaque identifier from the coordinator.
    pub id: String,
    /// The test run this job belongs to.
    pub test_run_id: i64,
    /// Revision the command must run against.
    pub commit_sha: String,
    /// Predicted cost, already defaulted to the sentinel if missing.
    pub cost_prediction_seconds: f64,
    /// When the coordinator generated this job.
    pub sent_at_seconds_since_epoch: f64,
    /// RFC3339 creation timestamp as reported by the coordinator.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Shell command to execute.
    pub command: String,
    /// When the Manager placed this job on the local queue.
    pub queued_at_seconds_since_epoch: Option<f64>,
    /// When the Worker began executing this job.
    pub started_at_seconds_since_epoch: Option<f64>,
    /// Combined stdout/stderr captured by the subprocess runner.
    pub result: Option<String>,
    /// Classification of `result` once the job has run.
    pub result_type: Option<ResultType>,
    /// Seconds spent queued before dispatch.
    pub worker_in_queue_seconds: Option<f64>,
    /// Seconds the command actually ran for.
    pub worker_command_run_seconds: Option<f64>,
}

/// A request to prepare the working tree / build environment ahead of
/// running a test run's jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupJob {
    /// Synthesised as `setup_job_<test_run_id>`.
    pub id: String,
    /// The test run this setup prepares for.
    pub test_run_id: i64,
    /// Revision to check out before running the build script.
    pub commit_sha: String,
    /// Predicted cost, already defaulted to the sentinel if missing.
    pub cost_prediction_seconds: f64,
    /// When the coordinator generated this job.
    pub sent_at_seconds_since_epoch: f64,
    /// Project build/test configuration supplied inline by the
    /// coordinator (the `testributor.yml` contents).
    pub testributor_yml: String,
    /// When the Manager placed this job on the local queue.
    pub queued_at_seconds_since_epoch: Option<f64>,
    /// Combined output of the setup run, once executed.
    pub result: Option<String>,
}

impl SetupJob {
    /// Synthesises the coordinator-visible id for a setup job, mirroring
    /// the wire contract's `setup_job_<test_run_id>` convention.
    pub fn synthesize_id(test_run_id: i64) -> String {
        format!("setup_job_{test_run_id}")
    }
}
