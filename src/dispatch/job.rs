//! Job descriptors exchanged between producer, dispatcher and workers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One mutant's execution request, and later its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Stable identifier assigned by the producer.
    pub id: String,
    /// Location of the mutant artifact to exercise.
    pub assembly_path: PathBuf,
    /// Tests to run, in order. Empty means the whole suite.
    #[serde(default)]
    pub tests_to_run: Vec<String>,
    /// Elapsed milliseconds of the unconstrained baseline run.
    #[serde(default)]
    pub total_ms_benchmark: Option<u64>,
    /// Whether the tests passed. `None` until the job has executed.
    #[serde(default)]
    pub tests_pass: Option<bool>,
    /// Whether a timed run finished before its deadline.
    #[serde(default)]
    pub exited_in_time: Option<bool>,
}

/// Outcome derived from the tri-state result fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Never executed.
    Skipped,
    /// Suite passed; the mutant survived.
    Passed,
    /// Suite failed or the worker died; the mutant was killed.
    Failed,
    /// The run overran its deadline and was killed.
    TimedOut,
}

impl JobDescriptor {
    /// Describe a job running `tests_to_run` (or the whole suite) against `assembly_path`.
    pub fn new(assembly_path: impl Into<PathBuf>, tests_to_run: Vec<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let tests_to_run = tests_to_run
            .into_iter()
            .filter(|test| seen.insert(test.clone()))
            .collect();
        Self {
            id: generate_job_id(),
            assembly_path: assembly_path.into(),
            tests_to_run,
            total_ms_benchmark: None,
            tests_pass: None,
            exited_in_time: None,
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a baseline measurement.
    pub fn with_benchmark_ms(mut self, total_ms: u64) -> Self {
        self.total_ms_benchmark = Some(total_ms);
        self
    }

    /// True when no specific tests were selected.
    pub fn runs_full_suite(&self) -> bool {
        self.tests_to_run.is_empty()
    }

    /// True once a terminal result has been written.
    pub fn is_executed(&self) -> bool {
        self.tests_pass.is_some()
    }

    /// Attribute a failure to this job, e.g. because its worker died.
    pub fn mark_failed(&mut self) {
        self.tests_pass = Some(false);
    }

    /// Outcome view over the result fields.
    pub fn outcome(&self) -> JobOutcome {
        match (self.tests_pass, self.exited_in_time) {
            (None, _) => JobOutcome::Skipped,
            (Some(_), Some(false)) => JobOutcome::TimedOut,
            (Some(true), _) => JobOutcome::Passed,
            (Some(false), _) => JobOutcome::Failed,
        }
    }

    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("job descriptors should serialize")
    }

    /// Parse the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn generate_job_id() -> String {
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!("job-{}-{}-{}", now_timestamp_ms(), std::process::id(), seq)
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    (duration.as_secs() as i64)
        .saturating_mul(1000)
        .saturating_add(duration.subsec_millis() as i64)
}
