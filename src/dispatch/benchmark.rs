//! Baseline benchmarking and benchmark-derived deadlines.
//!
//! A mutant's first run has no deadline; its wall-clock time becomes the job's
//! `total_ms_benchmark`. Later runs of the same test group may take at most
//! `kill_time_factor × total_ms_benchmark` before they are killed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::engine::TestEngine;
use super::job::JobDescriptor;

/// Derives per-job deadlines from baseline measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    kill_time_factor: f64,
}

impl TimeoutPolicy {
    /// Policy scaling baselines by `kill_time_factor`.
    ///
    /// Negative or non-finite factors are treated as zero.
    pub fn new(kill_time_factor: f64) -> Self {
        let kill_time_factor = if kill_time_factor.is_finite() && kill_time_factor > 0.0 {
            kill_time_factor
        } else {
            0.0
        };
        Self { kill_time_factor }
    }

    /// Multiplier applied to baselines.
    pub fn kill_time_factor(&self) -> f64 {
        self.kill_time_factor
    }

    /// Deadline for `job`, or `None` when it has no baseline yet.
    pub fn deadline_for(&self, job: &JobDescriptor) -> Option<Duration> {
        job.total_ms_benchmark.map(|ms| self.scale(ms))
    }

    fn scale(&self, baseline_ms: u64) -> Duration {
        let secs = baseline_ms as f64 * self.kill_time_factor / 1000.0;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Runs jobs once without a deadline to measure their baseline.
#[derive(Clone)]
pub struct Benchmarker {
    engine: Arc<dyn TestEngine>,
}

impl Benchmarker {
    /// Benchmark with `engine`.
    pub fn new(engine: Arc<dyn TestEngine>) -> Self {
        Self { engine }
    }

    /// Run `job` to completion, recording elapsed time and pass/fail.
    ///
    /// A run that cannot be started counts as failed with no baseline.
    pub async fn benchmark(&self, mut job: JobDescriptor) -> JobDescriptor {
        let started = Instant::now();
        let mut run = match self.engine.start(&job.assembly_path, &job.tests_to_run).await {
            Ok(run) => run,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "baseline run failed to start");
                job.tests_pass = Some(false);
                return job;
            }
        };

        let finished = run.wait_for_exit(None).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        job.total_ms_benchmark = Some(elapsed_ms);
        job.tests_pass = Some(matches!(finished, Ok(true)) && run.exit_code() == Some(0));

        debug!(
            job_id = %job.id,
            elapsed_ms,
            tests_pass = ?job.tests_pass,
            "baseline run finished"
        );
        job
    }
}

/// Run `job` under the deadline `policy` derives for it.
///
/// Jobs without a baseline are benchmarked instead. An overrun kills the run
/// and marks the job as failed and not exited in time.
pub async fn run_timed(
    engine: &Arc<dyn TestEngine>,
    policy: TimeoutPolicy,
    job: JobDescriptor,
) -> JobDescriptor {
    let Some(deadline) = policy.deadline_for(&job) else {
        debug!(job_id = %job.id, "no baseline recorded, running unconstrained");
        return Benchmarker::new(engine.clone()).benchmark(job).await;
    };

    let mut job = job;
    let mut run = match engine.start(&job.assembly_path, &job.tests_to_run).await {
        Ok(run) => run,
        Err(err) => {
            warn!(job_id = %job.id, error = %err, "timed run failed to start");
            job.tests_pass = Some(false);
            return job;
        }
    };

    match run.wait_for_exit(Some(deadline)).await {
        Ok(true) => {
            job.exited_in_time = Some(true);
            job.tests_pass = Some(run.exit_code() == Some(0));
        }
        Ok(false) => {
            warn!(
                job_id = %job.id,
                deadline_ms = deadline.as_millis() as u64,
                "timed run exceeded its deadline, killing"
            );
            run.kill().await;
            job.exited_in_time = Some(false);
            job.tests_pass = Some(false);
        }
        Err(err) => {
            warn!(job_id = %job.id, error = %err, "lost track of timed run");
            run.kill().await;
            job.tests_pass = Some(false);
        }
    }
    job
}
