//! Worker handles: one runner subprocess plus its private queue pair.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::{DispatcherConfig, RunnerConfig};
use super::engine::TestEngine;
use super::job::JobDescriptor;
use super::process::{ExitReport, Subprocess};
use super::runner;
use super::transport::{SharedTransport, TransportError};

/// Environment variable naming the program launched in runner mode.
pub const RUNNER_ENV: &str = "MUTANT_DISPATCH_RUNNER";

/// How long `get_result` keeps listening after the runner exits.
///
/// One-time runners publish their result and exit immediately, so the exit
/// can be observed before the message.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Worker-handle failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Private queue operation failed.
    #[error("worker transport failure: {0}")]
    Transport(#[from] TransportError),
    /// Runner process ended without producing a result.
    #[error("worker in slot {slot} exited: {report:?}")]
    Exited {
        /// Slot of the dead worker.
        slot: usize,
        /// How the process ended.
        report: ExitReport,
    },
    /// Worker was killed while the caller was using it.
    #[error("worker in slot {slot} was killed")]
    Killed {
        /// Slot of the killed worker.
        slot: usize,
    },
    /// Runner answered with something that is not a job descriptor.
    #[error("worker returned a malformed result: {0}")]
    Codec(#[from] serde_json::Error),
    /// Runner process could not be started.
    #[error("failed to launch runner: {0}")]
    Launch(#[source] std::io::Error),
}

/// Starts runner processes.
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Launch a runner serving `config`'s queue pair.
    fn launch(&self, config: &RunnerConfig) -> std::io::Result<Subprocess>;
}

/// Launches runners as OS processes: `<program> runner <in> <out> <one-time> <factor>`.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
}

impl ExecLauncher {
    /// Subcommand the program must understand.
    pub const RUNNER_SUBCOMMAND: &'static str = "runner";

    /// Launch `program` in runner mode.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch the currently running executable in runner mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Launch the program named by `MUTANT_DISPATCH_RUNNER`, else the current executable.
    pub fn from_env() -> std::io::Result<Self> {
        match std::env::var_os(RUNNER_ENV).filter(|program| !program.is_empty()) {
            Some(program) => Ok(Self::new(program)),
            None => Self::current_exe(),
        }
    }

    /// Program being launched.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl WorkerLauncher for ExecLauncher {
    fn launch(&self, config: &RunnerConfig) -> std::io::Result<Subprocess> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg(Self::RUNNER_SUBCOMMAND)
            .args(config.to_launch_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        Subprocess::spawn_command(cmd)
    }
}

/// Runs runners as tasks inside the current process.
#[derive(Clone)]
pub struct InProcessLauncher {
    transport: SharedTransport,
    engine: Arc<dyn TestEngine>,
}

impl InProcessLauncher {
    /// Runners share `transport` and execute through `engine`.
    pub fn new(transport: SharedTransport, engine: Arc<dyn TestEngine>) -> Self {
        Self { transport, engine }
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, config: &RunnerConfig) -> std::io::Result<Subprocess> {
        let transport = self.transport.clone();
        let engine = self.engine.clone();
        let config = config.clone();
        Ok(Subprocess::spawn_task(async move {
            match runner::serve(transport, engine, config, CancellationToken::new()).await {
                Ok(_) => 0,
                Err(err) => {
                    debug!(error = %err, "in-process runner stopped");
                    1
                }
            }
        }))
    }
}

/// One worker: a runner process and the queue pair it serves.
pub struct WorkerHandle {
    slot: usize,
    generation: u64,
    config: RunnerConfig,
    process: Subprocess,
    transport: SharedTransport,
    retired: AtomicBool,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("inbound_queue", &self.config.inbound_queue)
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl WorkerHandle {
    /// Declare the private queues for `slot`/`generation` and launch its runner.
    pub async fn spawn(
        slot: usize,
        generation: u64,
        dispatcher: &DispatcherConfig,
        transport: SharedTransport,
        launcher: &dyn WorkerLauncher,
    ) -> Result<Self, WorkerError> {
        let config = dispatcher.runner_config(slot, generation);
        transport.declare(&config.inbound_queue).await?;
        transport.declare(&config.outbound_queue).await?;
        let process = launcher.launch(&config).map_err(WorkerError::Launch)?;
        debug!(slot, generation, queue = %config.inbound_queue, pid = ?process.id(), "worker started");
        Ok(Self {
            slot,
            generation,
            config,
            process,
            transport,
            retired: AtomicBool::new(false),
        })
    }

    /// Pool slot this worker occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Replacement generation within the slot, starting at zero.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue the worker receives jobs on.
    pub fn inbound_queue(&self) -> &str {
        &self.config.inbound_queue
    }

    /// Queue the worker answers on.
    pub fn outbound_queue(&self) -> &str {
        &self.config.outbound_queue
    }

    /// Whether the runner exits after one job.
    pub fn is_one_time(&self) -> bool {
        self.config.one_time
    }

    /// True once killed, or once its runner can no longer take work.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst) || self.process.has_exited()
    }

    /// Hand `job` to the runner.
    pub async fn send_job(&self, job: &JobDescriptor) -> Result<(), WorkerError> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(WorkerError::Killed { slot: self.slot });
        }
        if let Some(report) = self.process.try_exit() {
            return Err(WorkerError::Exited {
                slot: self.slot,
                report,
            });
        }
        self.transport
            .publish(&self.config.inbound_queue, &job.to_bytes())
            .await?;
        Ok(())
    }

    /// Wait for the runner's answer to the job it was handed.
    ///
    /// Fails when the runner dies, is killed, or its queues disappear.
    pub async fn get_result(&self) -> Result<JobDescriptor, WorkerError> {
        let queue = self.config.outbound_queue.as_str();
        let received = tokio::select! {
            biased;
            received = self.transport.receive(queue) => received,
            report = self.process.exited() => {
                match tokio::time::timeout(EXIT_DRAIN, self.transport.receive(queue)).await {
                    Ok(Ok(payload)) => Ok(payload),
                    _ => return Err(self.exit_error(report)),
                }
            }
        };

        match received {
            Ok(payload) => Ok(JobDescriptor::from_bytes(&payload)?),
            Err(_) if self.retired.load(Ordering::SeqCst) => {
                Err(WorkerError::Killed { slot: self.slot })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn exit_error(&self, report: ExitReport) -> WorkerError {
        if self.retired.load(Ordering::SeqCst) || report == ExitReport::Killed {
            WorkerError::Killed { slot: self.slot }
        } else {
            WorkerError::Exited {
                slot: self.slot,
                report,
            }
        }
    }

    /// Terminate the runner and release its queues. Never fails.
    pub async fn kill(&self) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.process.kill();
        for queue in [&self.config.inbound_queue, &self.config.outbound_queue] {
            if let Err(err) = self.transport.delete(queue).await {
                warn!(slot = self.slot, queue = %queue, error = %err, "failed to delete worker queue");
            }
        }
        debug!(slot = self.slot, generation = self.generation, "worker killed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::engine::{EngineError, TestRun};
    use crate::dispatch::transport::{MemoryTransport, Transport};

    struct PassingEngine;

    struct PassingRun;

    #[async_trait]
    impl TestRun for PassingRun {
        async fn wait_for_exit(&mut self, _limit: Option<Duration>) -> Result<bool, EngineError> {
            Ok(true)
        }

        fn exit_code(&self) -> Option<i32> {
            Some(0)
        }

        async fn kill(&mut self) {}
    }

    #[async_trait]
    impl TestEngine for PassingEngine {
        async fn start(&self, _: &Path, _: &[String]) -> Result<Box<dyn TestRun>, EngineError> {
            Ok(Box::new(PassingRun))
        }
    }

    /// Launches runners that never read their queue and exit at once.
    struct ExitingLauncher;

    impl WorkerLauncher for ExitingLauncher {
        fn launch(&self, _config: &RunnerConfig) -> std::io::Result<Subprocess> {
            Ok(Subprocess::spawn_task(async { 9 }))
        }
    }

    /// Launches runners that never answer.
    struct SilentLauncher;

    impl WorkerLauncher for SilentLauncher {
        fn launch(&self, _config: &RunnerConfig) -> std::io::Result<Subprocess> {
            Ok(Subprocess::spawn_task(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                0
            }))
        }
    }

    fn dispatcher_config(one_time: bool) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_worker_queue_prefix("t")
            .with_one_time_runners(one_time)
    }

    #[tokio::test]
    async fn round_trip_through_in_process_runner() {
        let transport = MemoryTransport::shared();
        let launcher = InProcessLauncher::new(transport.clone(), Arc::new(PassingEngine));
        let handle = WorkerHandle::spawn(0, 0, &dispatcher_config(false), transport.clone(), &launcher)
            .await
            .expect("worker should spawn");
        assert_eq!(handle.inbound_queue(), "t-worker-0-g0-in");

        let job = JobDescriptor::new("/m", Vec::new()).with_benchmark_ms(10_000);
        handle.send_job(&job).await.expect("send should work");
        let result = handle.get_result().await.expect("result should arrive");
        assert_eq!(result.id, job.id);
        assert_eq!(result.tests_pass, Some(true));
        assert!(!handle.is_retired());
        handle.kill().await;
        assert!(handle.is_retired());
    }

    #[tokio::test]
    async fn one_time_runner_result_survives_its_exit() {
        let transport = MemoryTransport::shared();
        let launcher = InProcessLauncher::new(transport.clone(), Arc::new(PassingEngine));
        let handle = WorkerHandle::spawn(1, 0, &dispatcher_config(true), transport.clone(), &launcher)
            .await
            .expect("worker should spawn");
        assert!(handle.is_one_time());

        let job = JobDescriptor::new("/m", Vec::new()).with_benchmark_ms(10_000);
        handle.send_job(&job).await.expect("send should work");
        let result = handle.get_result().await.expect("result should arrive");
        assert_eq!(result.id, job.id);
    }

    #[tokio::test]
    async fn dead_runner_fails_send_and_get() {
        let transport = MemoryTransport::shared();
        let handle = WorkerHandle::spawn(0, 0, &dispatcher_config(false), transport.clone(), &ExitingLauncher)
            .await
            .expect("worker should spawn");

        let err = handle.get_result().await.expect_err("dead runner has no result");
        assert!(matches!(
            err,
            WorkerError::Exited {
                slot: 0,
                report: ExitReport::Code(9)
            }
        ));
        let job = JobDescriptor::new("/m", Vec::new());
        assert!(matches!(
            handle.send_job(&job).await,
            Err(WorkerError::Exited { .. })
        ));
    }

    #[tokio::test]
    async fn kill_unblocks_a_pending_get_result() {
        let transport = MemoryTransport::shared();
        let handle = Arc::new(
            WorkerHandle::spawn(2, 3, &dispatcher_config(false), transport.clone(), &SilentLauncher)
                .await
                .expect("worker should spawn"),
        );
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.get_result().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.kill().await;

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task should join");
        assert!(matches!(result, Err(WorkerError::Killed { slot: 2 })));
        assert!(transport.publish("t-worker-2-g3-in", b"x").await.is_err());
    }
}
