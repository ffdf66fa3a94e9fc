//! Worker-side serving loops.
//!
//! A runner consumes job descriptors from its private inbound queue, executes
//! them through a [`TestEngine`] and publishes the updated descriptor on its
//! private outbound queue. The benchmarker loop is the same with untimed
//! baseline runs instead of deadline-bounded ones.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::benchmark::{Benchmarker, TimeoutPolicy, run_timed};
use super::config::RunnerConfig;
use super::engine::TestEngine;
use super::job::JobDescriptor;
use super::transport::{SharedTransport, TransportError};

/// Runner failures. Any of these ends the serving loop.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Queue declaration, receive or publish failed.
    #[error("runner transport failure: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Clone)]
enum RunMode {
    Timed(TimeoutPolicy),
    Baseline(Benchmarker),
}

/// Serve timed runs until shutdown, or after one job in one-time mode.
///
/// Returns the number of jobs served.
pub async fn serve(
    transport: SharedTransport,
    engine: Arc<dyn TestEngine>,
    config: RunnerConfig,
    shutdown: CancellationToken,
) -> Result<usize, RunnerError> {
    let mode = RunMode::Timed(TimeoutPolicy::new(config.kill_time_factor));
    serve_queue(transport, engine, &config, mode, shutdown).await
}

/// Serve untimed baseline runs from `config.inbound_queue` until shutdown.
pub async fn serve_benchmarks(
    transport: SharedTransport,
    engine: Arc<dyn TestEngine>,
    config: RunnerConfig,
    shutdown: CancellationToken,
) -> Result<usize, RunnerError> {
    let mode = RunMode::Baseline(Benchmarker::new(engine.clone()));
    serve_queue(transport, engine, &config, mode, shutdown).await
}

async fn serve_queue(
    transport: SharedTransport,
    engine: Arc<dyn TestEngine>,
    config: &RunnerConfig,
    mode: RunMode,
    shutdown: CancellationToken,
) -> Result<usize, RunnerError> {
    transport.declare(&config.inbound_queue).await?;
    transport.declare(&config.outbound_queue).await?;
    info!(
        inbound = %config.inbound_queue,
        outbound = %config.outbound_queue,
        one_time = config.one_time,
        "runner listening"
    );

    let mut served = 0usize;
    loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = transport.receive(&config.inbound_queue) => received?,
        };

        let job = match JobDescriptor::from_bytes(&payload) {
            Ok(job) => job,
            Err(err) => {
                warn!(queue = %config.inbound_queue, error = %err, "dropping malformed job descriptor");
                continue;
            }
        };

        debug!(job_id = %job.id, tests = job.tests_to_run.len(), "running job");
        let job_id = job.id.clone();
        let run = async {
            match &mode {
                RunMode::Timed(policy) => run_timed(&engine, *policy, job).await,
                RunMode::Baseline(benchmarker) => benchmarker.benchmark(job).await,
            }
        };
        // Dropping an unfinished run kills its test process.
        let done = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                warn!(job_id = %job_id, "shutdown during run, abandoning job");
                break;
            }
            done = run => done,
        };
        transport
            .publish(&config.outbound_queue, &done.to_bytes())
            .await?;
        served += 1;

        if config.one_time {
            debug!(job_id = %done.id, "one-time runner finished its job");
            break;
        }
    }
    Ok(served)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::engine::{EngineError, TestRun};
    use crate::dispatch::job::JobOutcome;
    use crate::dispatch::transport::{MemoryTransport, Transport};

    /// Engine whose runs exit with the code encoded in the artifact file name.
    struct NamedExitEngine;

    struct InstantRun(i32);

    #[async_trait]
    impl TestRun for InstantRun {
        async fn wait_for_exit(&mut self, _limit: Option<Duration>) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn exit_code(&self) -> Option<i32> {
            Some(self.0)
        }

        async fn kill(&mut self) {}
    }

    #[async_trait]
    impl TestEngine for NamedExitEngine {
        async fn start(
            &self,
            assembly: &Path,
            _tests: &[String],
        ) -> Result<Box<dyn TestRun>, EngineError> {
            let code = assembly
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse().ok())
                .unwrap_or(0);
            Ok(Box::new(InstantRun(code)))
        }
    }

    async fn receive_job(transport: &MemoryTransport, queue: &str) -> JobDescriptor {
        let raw = tokio::time::timeout(Duration::from_secs(2), transport.receive(queue))
            .await
            .expect("result should arrive")
            .expect("receive should work");
        JobDescriptor::from_bytes(&raw).expect("result should decode")
    }

    #[tokio::test]
    async fn one_time_runner_serves_a_single_job() {
        let transport = MemoryTransport::shared();
        let config = RunnerConfig::new("r-in", "r-out").with_one_time(true);
        transport.declare("r-in").await.expect("declare should work");
        let job = JobDescriptor::new("/mutants/1", Vec::new()).with_benchmark_ms(1_000);
        transport
            .publish("r-in", &job.to_bytes())
            .await
            .expect("publish should work");

        let served = serve(
            transport.clone(),
            Arc::new(NamedExitEngine),
            config,
            CancellationToken::new(),
        )
        .await
        .expect("runner should finish");

        assert_eq!(served, 1);
        let result = receive_job(&transport, "r-out").await;
        assert_eq!(result.id, job.id);
        assert_eq!(result.outcome(), JobOutcome::Failed);
        assert_eq!(result.exited_in_time, Some(true));
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let transport = MemoryTransport::shared();
        let config = RunnerConfig::new("r-in", "r-out").with_one_time(true);
        transport.declare("r-in").await.expect("declare should work");
        transport
            .publish("r-in", b"not a job")
            .await
            .expect("publish should work");
        let job = JobDescriptor::new("/mutants/0", Vec::new()).with_benchmark_ms(1_000);
        transport
            .publish("r-in", &job.to_bytes())
            .await
            .expect("publish should work");

        serve(
            transport.clone(),
            Arc::new(NamedExitEngine),
            config,
            CancellationToken::new(),
        )
        .await
        .expect("runner should finish");

        let result = receive_job(&transport, "r-out").await;
        assert_eq!(result.outcome(), JobOutcome::Passed);
    }

    #[tokio::test]
    async fn benchmark_loop_records_baselines_until_shutdown() {
        let transport = MemoryTransport::shared();
        let config = RunnerConfig::new("b-in", "b-out");
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_benchmarks(
            transport.clone(),
            Arc::new(NamedExitEngine),
            config,
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..2 {
            let job = JobDescriptor::new("/mutants/0", Vec::new());
            transport
                .publish("b-in", &job.to_bytes())
                .await
                .expect("publish should work");
        }
        for _ in 0..2 {
            let result = receive_job(&transport, "b-out").await;
            assert!(result.total_ms_benchmark.is_some());
            assert_eq!(result.tests_pass, Some(true));
            assert_eq!(result.exited_in_time, None);
        }

        shutdown.cancel();
        let served = server
            .await
            .expect("server task should join")
            .expect("server should stop cleanly");
        assert_eq!(served, 2);
    }

    #[tokio::test]
    async fn deleted_inbound_queue_ends_the_loop() {
        let transport = MemoryTransport::shared();
        let config = RunnerConfig::new("d-in", "d-out");
        let server = tokio::spawn(serve(
            transport.clone(),
            Arc::new(NamedExitEngine),
            config,
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.delete("d-in").await.expect("delete should work");

        let result = server.await.expect("server task should join");
        assert!(matches!(
            result,
            Err(RunnerError::Transport(TransportError::Deleted(_)))
        ));
    }

    struct HangingEngine {
        dropped: Arc<std::sync::atomic::AtomicBool>,
    }

    struct HangingRun(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for HangingRun {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TestRun for HangingRun {
        async fn wait_for_exit(&mut self, _limit: Option<Duration>) -> Result<bool, EngineError> {
            std::future::pending().await
        }

        fn exit_code(&self) -> Option<i32> {
            None
        }

        async fn kill(&mut self) {}
    }

    #[async_trait]
    impl TestEngine for HangingEngine {
        async fn start(
            &self,
            _assembly: &Path,
            _tests: &[String],
        ) -> Result<Box<dyn TestRun>, EngineError> {
            Ok(Box::new(HangingRun(self.dropped.clone())))
        }
    }

    #[tokio::test]
    async fn shutdown_abandons_the_run_in_progress() {
        let transport = MemoryTransport::shared();
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            transport.clone(),
            Arc::new(HangingEngine {
                dropped: dropped.clone(),
            }),
            RunnerConfig::new("h-in", "h-out"),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = JobDescriptor::new("/mutants/hang", Vec::new());
        transport
            .publish("h-in", &job.to_bytes())
            .await
            .expect("publish should work");
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        let served = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("runner should stop promptly")
            .expect("server task should join")
            .expect("server should stop cleanly");
        assert_eq!(served, 0);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(transport.depth("h-out"), 0);
    }
}
