// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HTTP client for the coordinator's API: job fetch, batch result
//! upload, and liveness beacon. This is a named external collaborator,
//! not part of the three-actor concurrency engine — it stays thin and
//! delegates all arithmetic back to the Manager/Reporter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::job::{Job, JobKind, SetupJob, TestJob, NO_PREDICTION_WORKLOAD_SECONDS, REQUEST_ERROR_TIMEOUT_SECONDS};

/// Default coordinator base URL when `TESTRIBUTOR_URL` is unset.
pub const DEFAULT_COORDINATOR_URL: &str = "https://www.testributor.com/";

/// Either a batch of test jobs, or a single setup job, exactly as the
/// coordinator's loosely-typed `bind_next_batch` response distinguishes.
#[derive(Debug, Clone)]
pub enum FetchedBatch {
    /// Zero or more test jobs.
    Jobs(Vec<Job>),
    /// A single setup job for a new test run.
    Setup(Job),
}

/// Abstraction over "can fetch the next batch of work", so the
/// Manager's FetchLoop is testable without a live coordinator.
pub trait JobSource {
    /// Fetches the next batch, retrying transport errors internally
    /// per the fixed-interval policy; only non-retryable errors
    /// (auth, malformed response) are returned.
    fn fetch_next_batch(
        &self,
    ) -> impl std::future::Future<Output = Result<FetchedBatch, CoordinatorError>> + Send;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
}

/// Coordinator HTTP client: OAuth2 client-credentials auth, a
/// `WORKER_UUID` header on every request, and a fixed-interval retry
/// loop on transport failure.
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    worker_uuid: Uuid,
    token: Mutex<Option<CachedToken>>,
}

impl CoordinatorClient {
    /// Builds a client against `base_url`, generating a fresh
    /// `WORKER_UUID` for the lifetime of the process.
    pub fn new(base_url: impl Into<String>, app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            worker_uuid: Uuid::new_v4(),
            token: Mutex::new(None),
        }
    }

    /// The process-wide worker identifier attached to every request.
    pub fn worker_uuid(&self) -> Uuid {
        self.worker_uuid
    }

    /// First 8 characters of [`Self::worker_uuid`], used in log lines.
    pub fn worker_uuid_short(&self) -> String {
        self.worker_uuid.simple().to_string()[..8].to_string()
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}api/v1/{}", self.base_url, path)
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String, CoordinatorError> {
        let mut guard = self.token.lock().await;
        if !force_refresh {
            if let Some(cached) = guard.as_ref() {
                return Ok(cached.access_token.clone());
            }
        }

        let response = send_with_retry(|| {
            self.http
                .post(format!("{}oauth/token", self.base_url))
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", self.app_id.as_str()),
                    ("client_secret", self.app_secret.as_str()),
                ])
        })
        .await;

        if !response.status().is_success() {
            return Err(CoordinatorError::TokenError(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CoordinatorError::TokenError(e.to_string()))?;

        let access_token = token.access_token.clone();
        *guard = Some(CachedToken { access_token: access_token.clone() });
        Ok(access_token)
    }

    async fn authorized_request(
        &self,
        build: impl Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CoordinatorError> {
        let token = self.access_token(false).await?;
        let response = send_with_retry(|| {
            build(&self.http, &token).header("WORKER_UUID", self.worker_uuid.to_string())
        })
        .await;

        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        warn!("coordinator rejected token, refreshing");
        let token = self.access_token(true).await?;
        let retried = send_with_retry(|| {
            build(&self.http, &token).header("WORKER_UUID", self.worker_uuid.to_string())
        })
        .await;

        if retried.status().as_u16() == 401 {
            return Err(CoordinatorError::Unauthorized);
        }
        Ok(retried)
    }

    /// Fetches the next batch of work, retrying transport errors
    /// indefinitely at a fixed interval, per spec.
    pub async fn fetch_next_batch_inner(&self) -> Result<FetchedBatch, CoordinatorError> {
        let url = self.api_url("test_jobs/bind_next_batch");
        let response = self
            .authorized_request(move |client, token| {
                client
                    .patch(&url)
                    .bearer_auth(token)
            })
            .await?;

        if response.status().as_u16() == 401 {
            return Err(CoordinatorError::Unauthorized);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoordinatorError::MalformedResponse(e.to_string()))?;

        decode_fetch_batch(body)
    }

    /// Uploads a batch of completed jobs as `multipart/form-data`,
    /// returning any `delete_test_runs` ids the coordinator sent back.
    pub async fn batch_update(&self, jobs: &[Job]) -> Result<Vec<i64>, CoordinatorError> {
        let url = self.api_url("test_jobs/batch_update");

        let response = self
            .authorized_request(move |client, token| {
                // reqwest's multipart::Form isn't Clone, so each retry
                // attempt re-encodes the same jobs slice from scratch.
                let mut form = reqwest::multipart::Form::new();
                for job in jobs {
                    let payload = upload_payload(job);
                    let json = serde_json::to_string(&payload).unwrap_or_default();
                    form = form.text(format!("jobs[{}]", job.id()), json);
                }
                client.patch(&url).bearer_auth(token).multipart(form)
            })
            .await?;

        if response.status().as_u16() == 401 {
            return Err(CoordinatorError::Unauthorized);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoordinatorError::MalformedResponse(e.to_string()))?;

        Ok(body
            .get("delete_test_runs")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default())
    }

    /// Sends a bare liveness beacon.
    pub async fn beacon(&self) -> Result<(), CoordinatorError> {
        let url = self.api_url("projects/beacon");
        let response = self
            .authorized_request(move |client, token| client.post(&url).bearer_auth(token))
            .await?;

        if response.status().as_u16() == 401 {
            return Err(CoordinatorError::Unauthorized);
        }
        Ok(())
    }
}

/// Sends a request built fresh by `build` on every attempt, retrying
/// indefinitely at a fixed interval on transport failure. Never
/// returns an error: a coordinator that is briefly unreachable blocks
/// the caller rather than surfacing a failure. Application-level
/// errors (4xx/5xx) are surfaced through the returned response's
/// status, not here.
async fn send_with_retry(build: impl Fn() -> reqwest::RequestBuilder) -> reqwest::Response {
    loop {
        match build().send().await {
            Ok(response) => return response,
            Err(err) => {
                error!(%err, "transport error talking to coordinator, retrying");
                sleep(Duration::from_secs(REQUEST_ERROR_TIMEOUT_SECONDS)).await;
            }
        }
    }
}

impl JobSource for CoordinatorClient {
    async fn fetch_next_batch(&self) -> Result<FetchedBatch, CoordinatorError> {
        self.fetch_next_batch_inner().await
    }
}

impl crate::reporter::ReportSink for CoordinatorClient {
    async fn batch_update(&self, jobs: &[Job]) -> Result<Vec<i64>, CoordinatorError> {
        CoordinatorClient::batch_update(self, jobs).await
    }

    async fn beacon(&self) -> Result<(), CoordinatorError> {
        CoordinatorClient::beacon(self).await
    }
}

#[derive(Serialize)]
struct UploadPayload<'a> {
    id: &'a str,
    cost_prediction_seconds: f64,
    sent_at_seconds_since_epoch: Option<f64>,
    started_at_seconds_since_epoch: Option<f64>,
    created_at: Option<DateTime<Utc>>,
    command: Option<&'a str>,
    result: Option<&'a str>,
    status: Option<u8>,
    test_run_id: i64,
    worker_in_queue_seconds: Option<f64>,
    worker_command_run_seconds: Option<f64>,
}

fn upload_payload(job: &Job) -> UploadPayload<'_> {
    match job {
        Job::Test(t) => UploadPayload {
            id: &t.id,
            cost_prediction_seconds: t.cost_prediction_seconds,
            sent_at_seconds_since_epoch: Some(t.sent_at_seconds_since_epoch),
            started_at_seconds_since_epoch: t.started_at_seconds_since_epoch,
            created_at: Some(t.created_at),
            command: Some(&t.command),
            result: t.result.as_deref(),
            status: t.result_type.map(|r| r as u8),
            test_run_id: t.test_run_id,
            worker_in_queue_seconds: t.worker_in_queue_seconds,
            worker_command_run_seconds: t.worker_command_run_seconds,
        },
        Job::Setup(s) => UploadPayload {
            id: &s.id,
            cost_prediction_seconds: s.cost_prediction_seconds,
            sent_at_seconds_since_epoch: Some(s.sent_at_seconds_since_epoch),
            started_at_seconds_since_epoch: None,
            created_at: None,
            command: None,
            result: s.result.as_deref(),
            status: None,
            test_run_id: s.test_run_id,
            worker_in_queue_seconds: None,
            worker_command_run_seconds: None,
        },
    }
}

/// Peeks at the JSON shape of a `bind_next_batch` response and routes
/// it to the right constructor: an array decodes to test jobs, an
/// object decodes to a single setup job.
fn decode_fetch_batch(body: Value) -> Result<FetchedBatch, CoordinatorError> {
    match body {
        Value::Array(items) => {
            let mut jobs = Vec::with_capacity(items.len());
            for item in items {
                jobs.push(Job::Test(decode_test_job(item)?));
            }
            Ok(FetchedBatch::Jobs(jobs))
        }
        Value::Object(_) => Ok(FetchedBatch::Setup(Job::Setup(decode_setup_job(body)?))),
        other => Err(CoordinatorError::MalformedResponse(format!(
            "expected an array or object, got {other}"
        ))),
    }
}

fn decode_test_job(value: Value) -> Result<TestJob, CoordinatorError> {
    let id = value
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| CoordinatorError::MalformedResponse("missing id".into()))?
        .to_string();

    let cost_prediction_seconds = parse_cost_prediction(value.get("cost_prediction"));

    let sent_at_seconds_since_epoch = value
        .get("sent_at_seconds_since_epoch")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let created_at = value
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let command = value
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let test_run = value.get("test_run");
    let test_run_id = test_run
        .and_then(|tr| tr.get("id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| CoordinatorError::MalformedResponse("missing test_run.id".into()))?;
    let commit_sha = test_run
        .and_then(|tr| tr.get("commit_sha"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(TestJob {
        id,
        test_run_id,
        commit_sha,
        cost_prediction_seconds,
        sent_at_seconds_since_epoch,
        created_at,
        command,
        queued_at_seconds_since_epoch: None,
        started_at_seconds_since_epoch: None,
        result: None,
        result_type: None,
        worker_in_queue_seconds: None,
        worker_command_run_seconds: None,
    })
}

fn decode_setup_job(value: Value) -> Result<SetupJob, CoordinatorError> {
    let test_run = value.get("test_run");
    let test_run_id = test_run
        .and_then(|tr| tr.get("id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| CoordinatorError::MalformedResponse("missing test_run.id".into()))?;
    let commit_sha = test_run
        .and_then(|tr| tr.get("commit_sha"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let testributor_yml = value
        .get("testributor_yml")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let cost_prediction_seconds = match value.get("cost_prediction").and_then(Value::as_f64) {
        Some(v) if v > 0.0 => v,
        _ => NO_PREDICTION_WORKLOAD_SECONDS,
    };
    let sent_at_seconds_since_epoch = value
        .get("sent_at_seconds_since_epoch")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    Ok(SetupJob {
        id: SetupJob::synthesize_id(test_run_id),
        test_run_id,
        commit_sha,
        cost_prediction_seconds,
        sent_at_seconds_since_epoch,
        testributor_yml,
        queued_at_seconds_since_epoch: None,
        result: None,
    })
}

/// Parses the loosely-typed `cost_prediction` field: a numeric string,
/// a bare number, zero, or absent all collapse to a definite seconds
/// value, defaulting to the sentinel when no usable prediction exists.
fn parse_cost_prediction(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(NO_PREDICTION_WORKLOAD_SECONDS),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v > 0.0 => v,
            _ => NO_PREDICTION_WORKLOAD_SECONDS,
        },
        _ => NO_PREDICTION_WORKLOAD_SECONDS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_array_response_as_test_jobs() {
        let body = json!([
            {
                "id": 1,
                "cost_prediction": "4.5",
                "sent_at_seconds_since_epoch": 100.0,
                "created_at": "2024-01-01T00:00:00Z",
                "command": "rspec spec/foo_spec.rb",
                "test_run": { "id": 42, "commit_sha": "deadbeef" }
            }
        ]);

        let batch = decode_fetch_batch(body).unwrap();
        match batch {
            FetchedBatch::Jobs(jobs) => {
                assert_eq!(jobs.len(), 1);
                assert_eq!(jobs[0].id(), "1");
                assert_eq!(jobs[0].test_run_id(), 42);
                assert_eq!(jobs[0].cost_prediction_seconds(), 4.5);
            }
            FetchedBatch::Setup(_) => panic!("expected test jobs"),
        }
    }

    #[test]
    fn decode_object_response_as_setup_job() {
        let body = json!({
            "sent_at_seconds_since_epoch": 100.0,
            "cost_prediction": 0,
            "test_run": { "id": 7, "commit_sha": "cafef00d" },
            "testributor_yml": "script: rspec"
        });

        let batch = decode_fetch_batch(body).unwrap();
        match batch {
            FetchedBatch::Setup(job) => {
                assert_eq!(job.id(), "setup_job_7");
                assert_eq!(job.cost_prediction_seconds(), NO_PREDICTION_WORKLOAD_SECONDS);
            }
            FetchedBatch::Jobs(_) => panic!("expected setup job"),
        }
    }

    #[test]
    fn cost_prediction_zero_or_missing_uses_sentinel() {
        assert_eq!(parse_cost_prediction(None), NO_PREDICTION_WORKLOAD_SECONDS);
        assert_eq!(parse_cost_prediction(Some(&json!(0))), NO_PREDICTION_WORKLOAD_SECONDS);
        assert_eq!(parse_cost_prediction(Some(&json!("not-a-number"))), NO_PREDICTION_WORKLOAD_SECONDS);
        assert_eq!(parse_cost_prediction(Some(&json!("2.5"))), 2.5);
    }

    /// Job uploaded payload round-trips.
    #[test]
    fn upload_payload_round_trips_key_fields() {
        let job = Job::Test(TestJob {
            id: "9".into(),
            test_run_id: 99,
            commit_sha: "sha".into(),
            cost_prediction_seconds: 1.0,
            sent_at_seconds_since_epoch: 0.0,
            created_at: Utc::now(),
            command: "true".into(),
            queued_at_seconds_since_epoch: None,
            started_at_seconds_since_epoch: None,
            result: Some("ok".into()),
            result_type: Some(crate::job::ResultType::Passed),
            worker_in_queue_seconds: Some(1.0),
            worker_command_run_seconds: Some(2.0),
        });

        let payload = upload_payload(&job);
        let json_str = serde_json::to_string(&payload).unwrap();
        let decoded: Value = serde_json::from_str(&json_str).unwrap();

        assert_eq!(decoded["id"], "9");
        assert_eq!(decoded["test_run_id"], 99);
        assert_eq!(decoded["result"], "ok");
        assert_eq!(decoded["status"], 3);
    }

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_token(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "token_type": "bearer",
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fetch_next_batch_obtains_token_and_decodes_jobs() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1").await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/test_jobs/bind_next_batch"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": 1,
                    "cost_prediction": "4.5",
                    "sent_at_seconds_since_epoch": 100.0,
                    "created_at": "2024-01-01T00:00:00Z",
                    "command": "rspec spec/foo_spec.rb",
                    "test_run": { "id": 42, "commit_sha": "deadbeef" }
                }
            ])))
            .mount(&server)
            .await;

        let client = CoordinatorClient::new(format!("{}/", server.uri()), "id", "secret");
        let batch = client.fetch_next_batch_inner().await.unwrap();

        match batch {
            FetchedBatch::Jobs(jobs) => {
                assert_eq!(jobs.len(), 1);
                assert_eq!(jobs[0].id(), "1");
            }
            FetchedBatch::Setup(_) => panic!("expected test jobs"),
        }
    }

    /// Delete-test-runs parse, exercised through `batch_update` rather
    /// than re-implementing the JSON extraction inline.
    #[tokio::test]
    async fn batch_update_parses_delete_test_runs() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1").await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/test_jobs/batch_update"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "delete_test_runs": [1976],
            })))
            .mount(&server)
            .await;

        let client = CoordinatorClient::new(format!("{}/", server.uri()), "id", "secret");
        let job = Job::Test(TestJob {
            id: "9".into(),
            test_run_id: 99,
            commit_sha: "sha".into(),
            cost_prediction_seconds: 1.0,
            sent_at_seconds_since_epoch: 0.0,
            created_at: Utc::now(),
            command: "true".into(),
            queued_at_seconds_since_epoch: None,
            started_at_seconds_since_epoch: None,
            result: Some("ok".into()),
            result_type: Some(crate::job::ResultType::Passed),
            worker_in_queue_seconds: Some(1.0),
            worker_command_run_seconds: Some(2.0),
        });

        let deleted = client.batch_update(&[job]).await.unwrap();
        assert_eq!(deleted, vec![1976]);
    }

    /// A 401 on the bearer token in hand triggers exactly one refresh,
    /// and the retried request succeeds.
    #[tokio::test]
    async fn authorized_request_refreshes_token_on_401_then_succeeds() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1").await;

        // First call with the cached token is rejected; the retried
        // call, after a forced refresh, succeeds. `with_priority`
        // makes the precedence between the two explicit rather than
        // relying on mount order.
        Mock::given(method("POST"))
            .and(path("/api/v1/projects/beacon"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/projects/beacon"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&server)
            .await;

        let client = CoordinatorClient::new(format!("{}/", server.uri()), "id", "secret");
        client.beacon().await.expect("retried beacon should succeed after the token refresh");
    }

    /// A transport error while acquiring the token retries at a fixed
    /// interval instead of propagating, matching the behavior for any
    /// other coordinator transport error.
    #[tokio::test(start_paused = true)]
    async fn access_token_retries_transport_errors_instead_of_failing() {
        // Bind and immediately drop a listener: nothing answers on
        // this port, so every connection attempt is a transport error.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = CoordinatorClient::new(format!("http://{addr}/"), "id", "secret");
        let mut attempt = Box::pin(client.access_token(false));

        // The first connection attempt fails immediately; it should go
        // to sleep and retry rather than resolving with an error.
        tokio::time::timeout(Duration::from_millis(50), &mut attempt)
            .await
            .expect_err("should still be retrying, not resolved");

        // Advance past one retry interval: it reattempts, fails again
        // (still nothing listening), and goes back to sleep.
        tokio::time::advance(Duration::from_secs(REQUEST_ERROR_TIMEOUT_SECONDS + 1)).await;
        tokio::time::timeout(Duration::from_millis(50), &mut attempt)
            .await
            .expect_err("should still be retrying after one backoff interval");
    }
}
