//! In-memory batch jobs: one register lookup per row, results kept at the
//! row's index.

use crate::config::Jobs as JobsConfig;
use crate::metrics_defs::{JOB_ROWS, JOBS_CREATED, JOBS_FINISHED, ROW_DURATION, ROWS_PROCESSED};
use crate::spreadsheet::Batch;
use futures::FutureExt;
use moka::sync::Cache;
use parking_lot::Mutex;
use registry::request::normalize_query;
use registry::{RateLimiter, Registry, RegistryError, RegistryRecord};
use serde::Serialize;
use shared::{counter, histogram};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Finished,
}

/// Failure of a single row. The row also gets an error placeholder result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub index: usize,
    pub identifier: String,
    pub message: String,
}

/// Why a row ended without a record.
#[derive(thiserror::Error, Debug)]
enum RowFailure {
    #[error(transparent)]
    Lookup(#[from] RegistryError),
    #[error("lookup aborted: {0}")]
    Panicked(String),
}

impl RowFailure {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        RowFailure::Panicked(message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub status: JobStatus,
}

/// Everything a finished job produced.
#[derive(Clone, Debug, Serialize)]
pub struct JobOutcome {
    /// One entry per input row, in input order.
    pub results: Vec<RegistryRecord>,
    pub errors: Vec<RowError>,
    #[serde(skip)]
    pub finished_at: SystemTime,
}

struct JobState {
    done: usize,
    status: JobStatus,
    finished_at: Option<SystemTime>,
    results: Vec<Option<RegistryRecord>>,
    errors: Vec<RowError>,
}

pub struct Job {
    pub id: String,
    pub batch: Batch,
    pub started_at: SystemTime,
    state: Mutex<JobState>,
}

/// Strict identifier check: `EP` followed by digits only.
pub fn is_valid_identifier(identifier: &str) -> bool {
    identifier
        .strip_prefix("EP")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

impl Job {
    fn new(batch: Batch) -> Self {
        let total = batch.rows.len();
        let started_at = SystemTime::now();
        let finished = total == 0;

        Job {
            id: Uuid::new_v4().simple().to_string(),
            batch,
            started_at,
            state: Mutex::new(JobState {
                done: 0,
                status: if finished {
                    JobStatus::Finished
                } else {
                    JobStatus::Running
                },
                finished_at: finished.then_some(started_at),
                results: vec![None; total],
                errors: Vec::new(),
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.batch.rows.len()
    }

    pub fn progress(&self) -> Progress {
        let state = self.state.lock();
        Progress {
            done: state.done,
            total: self.total(),
            status: state.status,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().status == JobStatus::Finished
    }

    /// The first `limit` row errors recorded so far.
    pub fn errors(&self, limit: usize) -> Vec<RowError> {
        self.state.lock().errors.iter().take(limit).cloned().collect()
    }

    /// Results and errors, available only once every row has completed.
    pub fn outcome(&self) -> Option<JobOutcome> {
        let state = self.state.lock();
        let finished_at = state.finished_at?;
        let results = state
            .results
            .iter()
            .map(|slot| {
                slot.clone()
                    .unwrap_or_else(|| RegistryRecord::error("no result recorded"))
            })
            .collect();

        Some(JobOutcome {
            results,
            errors: state.errors.clone(),
            finished_at,
        })
    }

    /// Stores the row's result and advances the job. The done counter and the
    /// finished transition are updated under the same lock.
    fn complete_row(
        &self,
        index: usize,
        identifier: &str,
        result: Result<RegistryRecord, RowFailure>,
    ) {
        let mut state = self.state.lock();

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let message = e.to_string();
                state.errors.push(RowError {
                    index,
                    identifier: identifier.to_string(),
                    message: message.clone(),
                });
                RegistryRecord::error(message)
            }
        };
        state.results[index] = Some(record);
        state.done += 1;

        if state.done == self.total() && state.status == JobStatus::Running {
            let finished_at = SystemTime::now();
            state.finished_at = Some(finished_at);
            state.status = JobStatus::Finished;

            let elapsed = finished_at
                .duration_since(self.started_at)
                .unwrap_or_default();
            tracing::info!(
                job_id = %self.id,
                total = self.total(),
                errors = state.errors.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "job finished"
            );
            counter!(JOBS_FINISHED).increment(1);
        }
    }
}

async fn lookup_row(
    identifier: &str,
    registry: &dyn Registry,
    limiter: &RateLimiter,
) -> Result<RegistryRecord, RegistryError> {
    if !is_valid_identifier(identifier) {
        return Err(RegistryError::Format(identifier.to_string()));
    }
    limiter.schedule(registry.lookup(identifier)).await?
}

async fn process_row(
    job: Arc<Job>,
    index: usize,
    registry: Arc<dyn Registry>,
    limiter: Arc<RateLimiter>,
) {
    let started = Instant::now();
    let identifier = normalize_query(&job.batch.rows[index].identifier);

    // A panicking lookup still completes its row so the job can finish.
    let result = match AssertUnwindSafe(lookup_row(&identifier, registry.as_ref(), &limiter))
        .catch_unwind()
        .await
    {
        Ok(result) => result.map_err(RowFailure::from),
        Err(payload) => Err(RowFailure::from_panic(payload)),
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(RowFailure::Lookup(RegistryError::Format(_))) => "invalid",
        Err(RowFailure::Lookup(e)) => {
            tracing::warn!(job_id = %job.id, index, identifier = %identifier, "row failed: {e}");
            "error"
        }
        Err(RowFailure::Panicked(message)) => {
            tracing::error!(job_id = %job.id, index, identifier = %identifier, "row lookup panicked: {message}");
            "panic"
        }
    };
    counter!(ROWS_PROCESSED, "outcome" => outcome).increment(1);
    histogram!(ROW_DURATION).record(started.elapsed().as_secs_f64());

    job.complete_row(index, &identifier, result);
}

/// Owns every job and schedules their rows.
pub struct JobTracker {
    jobs: Cache<String, Arc<Job>>,
    registry: Arc<dyn Registry>,
    limiter: Arc<RateLimiter>,
}

impl JobTracker {
    pub fn new(config: &JobsConfig, registry: Arc<dyn Registry>, limiter: Arc<RateLimiter>) -> Self {
        let jobs = Cache::builder()
            .max_capacity(config.max_jobs)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();

        JobTracker {
            jobs,
            registry,
            limiter,
        }
    }

    /// Registers the job and starts one task per row. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_job(&self, batch: Batch) -> Arc<Job> {
        let job = Arc::new(Job::new(batch));
        self.jobs.insert(job.id.clone(), job.clone());

        tracing::info!(job_id = %job.id, total = job.total(), "job created");
        counter!(JOBS_CREATED).increment(1);
        histogram!(JOB_ROWS).record(job.total() as f64);

        for index in 0..job.total() {
            tokio::spawn(process_row(
                job.clone(),
                index,
                self.registry.clone(),
                self.limiter.clone(),
            ));
        }

        job
    }

    pub fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.get(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use registry::config::RateLimit;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry answering from a fixed table and counting calls per identifier.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub records: HashMap<String, RegistryRecord>,
        pub calls: Mutex<HashMap<String, usize>>,
        pub total_calls: AtomicUsize,
    }

    impl FakeRegistry {
        pub(crate) fn with_records(records: Vec<(&str, RegistryRecord)>) -> Self {
            FakeRegistry {
                records: records
                    .into_iter()
                    .map(|(id, record)| (id.to_string(), record))
                    .collect(),
                ..Default::default()
            }
        }

        pub(crate) fn calls_for(&self, identifier: &str) -> usize {
            self.calls.lock().get(identifier).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Registry for FakeRegistry {
        async fn lookup(&self, identifier: &str) -> Result<RegistryRecord, RegistryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().entry(identifier.to_string()).or_default() += 1;

            // Later rows finish first so completion order differs from input order.
            let delay = identifier.len() as u64 % 3;
            tokio::time::sleep(Duration::from_millis(5 * (3 - delay))).await;

            self.records
                .get(identifier)
                .cloned()
                .ok_or_else(|| RegistryError::NoMatch(identifier.to_string()))
        }
    }

    fn tracker(registry: Arc<FakeRegistry>) -> JobTracker {
        let limiter = Arc::new(RateLimiter::new(&RateLimit {
            max_concurrent: 4,
            min_spacing_ms: 0,
        }));
        JobTracker::new(&JobsConfig::default(), registry, limiter)
    }

    pub(crate) async fn wait_until_finished(job: &Job) {
        for _ in 0..500 {
            if job.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    pub(crate) fn record(status: &str, owners: &[(&str, &str)]) -> RegistryRecord {
        RegistryRecord {
            status_code: status.into(),
            owner_names: owners.iter().map(|(n, _)| n.to_string()).collect(),
            owner_addresses: owners.iter().map(|(_, a)| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_identifier_format() {
        assert!(is_valid_identifier("EP1234567"));
        assert!(!is_valid_identifier("EP"));
        assert!(!is_valid_identifier("EP12A4"));
        assert!(!is_valid_identifier("US1234567"));
        assert!(!is_valid_identifier("ep1234567"));
        assert!(!is_valid_identifier("EP١٢٣"));
    }

    #[tokio::test]
    async fn test_results_follow_row_order() {
        let registry = Arc::new(FakeRegistry::with_records(vec![
            ("EP1", record("GRANT", &[])),
            ("EP22", record("LAPSED", &[])),
            ("EP333", record("FILED", &[])),
        ]));
        let tracker = tracker(registry.clone());

        let job = tracker.create_job(Batch::from_identifiers(["EP333", " ep1 ", "EP22", "EP9"]));
        assert_eq!(job.progress().total, 4);
        assert!(job.outcome().is_none());

        wait_until_finished(&job).await;
        let outcome = job.outcome().unwrap();

        assert_eq!(outcome.results.len(), job.total());
        let statuses: Vec<&str> = outcome.results.iter().map(|r| r.status_code.as_str()).collect();
        assert_eq!(
            statuses,
            vec![
                "FILED",
                "GRANT",
                "LAPSED",
                "ERROR: No exact PublicationNumber match for EP9"
            ]
        );
        assert_eq!(
            outcome.errors,
            vec![RowError {
                index: 3,
                identifier: "EP9".into(),
                message: "No exact PublicationNumber match for EP9".into(),
            }]
        );
        assert_eq!(
            job.progress(),
            Progress {
                done: 4,
                total: 4,
                status: JobStatus::Finished
            }
        );
        assert!(outcome.finished_at >= job.started_at);
    }

    #[tokio::test]
    async fn test_invalid_identifier_makes_no_call() {
        let registry = Arc::new(FakeRegistry::with_records(vec![(
            "EP1234567",
            record("GRANT", &[]),
        )]));
        let tracker = tracker(registry.clone());

        let job = tracker.create_job(Batch::from_identifiers(["EP12X4", "EP1234567", ""]));
        wait_until_finished(&job).await;

        assert_eq!(registry.calls_for("EP12X4"), 0);
        assert_eq!(registry.calls_for(""), 0);
        assert_eq!(registry.total_calls.load(Ordering::SeqCst), 1);

        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.results[0].status_code, "ERROR: Invalid EP format: EP12X4");
        assert!(outcome.results[0].representative.is_empty());
        assert_eq!(outcome.results[1].status_code, "GRANT");
        assert_eq!(outcome.results[2].status_code, "ERROR: Invalid EP format: ");
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_every_row_failing_still_finishes() {
        let registry = Arc::new(FakeRegistry::default());
        let tracker = tracker(registry);

        let job = tracker.create_job(Batch::from_identifiers(["EP1", "EP2", "EP3"]));
        wait_until_finished(&job).await;

        let outcome = job.outcome().unwrap();
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(RegistryRecord::is_error));
        let mut failed: Vec<usize> = outcome.errors.iter().map(|e| e.index).collect();
        failed.sort();
        assert_eq!(failed, vec![0, 1, 2]);
    }

    /// Registry whose lookups panic for one identifier.
    struct PanickingRegistry;

    #[async_trait]
    impl Registry for PanickingRegistry {
        async fn lookup(&self, identifier: &str) -> Result<RegistryRecord, RegistryError> {
            if identifier == "EP1" {
                panic!("duration overflow");
            }
            Ok(record("GRANT", &[]))
        }
    }

    #[tokio::test]
    async fn test_panicking_lookup_still_finishes_job() {
        let limiter = Arc::new(RateLimiter::new(&RateLimit {
            max_concurrent: 1,
            min_spacing_ms: 0,
        }));
        let tracker = JobTracker::new(&JobsConfig::default(), Arc::new(PanickingRegistry), limiter);

        let job = tracker.create_job(Batch::from_identifiers(["EP1", "EP2"]));
        wait_until_finished(&job).await;

        let outcome = job.outcome().unwrap();
        assert_eq!(
            outcome.results[0].status_code,
            "ERROR: lookup aborted: duration overflow"
        );
        assert_eq!(outcome.results[1].status_code, "GRANT");
        assert_eq!(
            outcome.errors,
            vec![RowError {
                index: 0,
                identifier: "EP1".into(),
                message: "lookup aborted: duration overflow".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_finished() {
        let tracker = tracker(Arc::new(FakeRegistry::default()));
        let job = tracker.create_job(Batch::default());

        assert!(job.is_finished());
        assert!(job.outcome().unwrap().results.is_empty());
    }

    #[tokio::test]
    async fn test_get_job() {
        let tracker = tracker(Arc::new(FakeRegistry::default()));
        let job = tracker.create_job(Batch::from_identifiers(["EP1"]));

        let found = tracker.get_job(&job.id).expect("job is registered");
        assert!(Arc::ptr_eq(&found, &job));
        assert!(tracker.get_job("unknown").is_none());
    }
}
