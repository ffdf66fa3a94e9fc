//! The dispatcher: inbound queue, worker pool, outbound queue.
//!
//! Four kinds of tasks cooperate:
//!
//! - the receiver decodes jobs from the inbound queue into the unassigned FIFO;
//! - the dispatch loop hands each job to the first idle worker, bounded by a
//!   semaphore of `max_busy` permits;
//! - one completion watcher per in-flight job waits for the worker's answer
//!   and is the only place busy bookkeeping is released;
//! - the sender publishes completed jobs on the outbound queue.
//!
//! The command listener cancels the shared stop token on `stop`. Shutdown is
//! staged: dispatch stops, every worker is killed, watchers flush the jobs
//! they were holding (marked failed), undispatched jobs are returned
//! untouched, and the sender drains before [`Dispatcher::run`] returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::Command;
use super::config::{ConfigError, DispatcherConfig};
use super::job::JobDescriptor;
use super::pool::{Claim, PoolCounters, PoolStats, WorkerPool};
use super::process::{ExitReport, ExitStatusCode};
use super::transport::{SharedTransport, TransportError};
use super::worker::{WorkerError, WorkerLauncher};

/// Dispatcher and coordinator failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration rejected before start.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Queue setup or use failed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// A worker could not be launched or replaced.
    #[error("worker failure: {0}")]
    Worker(#[from] WorkerError),
    /// A dispatcher task panicked or was cancelled.
    #[error("dispatcher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// A result payload could not be decoded.
    #[error("malformed result: {0}")]
    Codec(#[from] serde_json::Error),
    /// The dispatcher process ended while results were still expected.
    #[error("dispatcher exited: {0:?}")]
    DispatcherExited(ExitReport),
    /// The dispatcher process could not be started.
    #[error("failed to launch dispatcher: {0}")]
    Launch(#[source] std::io::Error),
}

impl DispatchError {
    /// Process exit code reporting this failure.
    pub fn exit_code(&self) -> ExitStatusCode {
        match self {
            Self::Config(_) => ExitStatusCode::BadArguments,
            Self::Transport(_) => ExitStatusCode::TransportSetup,
            _ => ExitStatusCode::Unexpected,
        }
    }
}

/// Cloneable handle that requests a staged shutdown.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// True once shutdown was requested.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    pool: Arc<WorkerPool>,
    in_flight: Mutex<HashMap<usize, JobDescriptor>>,
    stop: CancellationToken,
}

/// Job dispatcher over a worker pool.
pub struct Dispatcher {
    config: DispatcherConfig,
    transport: SharedTransport,
    launcher: Arc<dyn WorkerLauncher>,
    counters: Arc<PoolCounters>,
    stop: CancellationToken,
}

impl Dispatcher {
    /// Dispatcher serving `config`'s queues with workers from `launcher`.
    pub fn new(
        config: DispatcherConfig,
        transport: SharedTransport,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            transport,
            launcher,
            counters: Arc::new(PoolCounters::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Handle for requesting shutdown from outside the command queue.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Run on a background task.
    pub fn start(self) -> RunningDispatcher {
        let stop = self.stop_handle();
        let counters = self.counters.clone();
        let task = tokio::spawn(self.run());
        RunningDispatcher {
            stop,
            counters,
            task,
        }
    }

    /// Run until stopped and drained.
    ///
    /// Only configuration, queue setup and worker launch failures are errors;
    /// worker faults during the run are absorbed into job results.
    pub async fn run(self) -> Result<PoolStats, DispatchError> {
        self.config.validate()?;
        for queue in [
            &self.config.inbound_queue,
            &self.config.outbound_queue,
            &self.config.command_queue,
        ] {
            self.transport.declare(queue).await?;
        }

        let pool = Arc::new(
            WorkerPool::start(
                self.config.clone(),
                self.transport.clone(),
                self.launcher.clone(),
                self.counters.clone(),
            )
            .await?,
        );
        info!(
            inbound = %self.config.inbound_queue,
            outbound = %self.config.outbound_queue,
            pool_size = self.config.pool_size,
            max_busy = self.config.max_busy,
            one_time = self.config.one_time_runners,
            "dispatcher started"
        );

        let (unassigned_tx, mut unassigned_rx) = unbounded_channel();
        let (completed_tx, completed_rx) = unbounded_channel();

        let receiver = tokio::spawn(receive_jobs(
            self.transport.clone(),
            self.config.inbound_queue.clone(),
            unassigned_tx,
            self.stop.clone(),
        ));
        let commands = tokio::spawn(listen_for_commands(
            self.transport.clone(),
            self.config.command_queue.clone(),
            self.stop.clone(),
        ));
        let sender = tokio::spawn(send_results(
            self.transport.clone(),
            self.config.outbound_queue.clone(),
            completed_rx,
        ));

        let shared = Arc::new(Shared {
            pool: pool.clone(),
            in_flight: Mutex::new(HashMap::new()),
            stop: self.stop.clone(),
        });
        let mut watchers = JoinSet::new();
        let outcome = self
            .dispatch_loop(&shared, &mut unassigned_rx, &completed_tx, &mut watchers)
            .await;

        self.stop.cancel();
        pool.kill_all().await;
        while let Some(joined) = watchers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "completion watcher failed");
            }
        }

        if let Err(err) = receiver.await {
            error!(error = %err, "receiver task failed");
        }
        while let Some(job) = unassigned_rx.recv().await {
            return_undispatched(&completed_tx, job);
        }
        drop(completed_tx);

        let published = sender.await?;
        if let Err(err) = commands.await {
            error!(error = %err, "command listener failed");
        }

        let stats = self.counters.snapshot();
        info!(
            published,
            restarts = stats.restarts,
            peak_busy = stats.peak_busy,
            "dispatcher drained"
        );
        outcome.map(|()| stats)
    }

    async fn dispatch_loop(
        &self,
        shared: &Arc<Shared>,
        unassigned: &mut UnboundedReceiver<JobDescriptor>,
        completed: &UnboundedSender<JobDescriptor>,
        watchers: &mut JoinSet<()>,
    ) -> Result<(), DispatchError> {
        let cap = Arc::new(Semaphore::new(self.config.max_busy));
        loop {
            let job = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                job = unassigned.recv() => match job {
                    Some(job) => job,
                    None => return Ok(()),
                },
            };

            if let Some(job) = self.dispatch(shared, &cap, job, completed, watchers).await? {
                return_undispatched(completed, job);
                return Ok(());
            }
        }
    }

    /// Hand `job` to a worker. Returns it back if stop arrived first.
    async fn dispatch(
        &self,
        shared: &Arc<Shared>,
        cap: &Arc<Semaphore>,
        job: JobDescriptor,
        completed: &UnboundedSender<JobDescriptor>,
        watchers: &mut JoinSet<()>,
    ) -> Result<Option<JobDescriptor>, DispatchError> {
        let permit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Ok(Some(job)),
            permit = cap.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(Some(job)),
            },
        };

        loop {
            let claim = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(Some(job)),
                claim = shared.pool.claim() => claim,
            };
            let claim = match claim {
                Ok(claim) => claim,
                Err(err) => {
                    return_undispatched(completed, job);
                    return Err(err.into());
                }
            };

            match claim.handle.send_job(&job).await {
                Ok(()) => {
                    self.launch_watcher(shared, claim, job, permit, completed.clone(), watchers);
                    return Ok(None);
                }
                Err(err) => {
                    warn!(
                        slot = claim.slot,
                        generation = claim.handle.generation(),
                        job_id = %job.id,
                        error = %err,
                        "failed to hand job to worker, replacing it"
                    );
                    let replaced = shared.pool.replace(claim.slot, &claim.handle).await;
                    shared.pool.unclaim(claim.slot);
                    if let Err(err) = replaced {
                        return_undispatched(completed, job);
                        return Err(err.into());
                    }
                    if self.stop.is_cancelled() {
                        return Ok(Some(job));
                    }
                }
            }
        }
    }

    fn launch_watcher(
        &self,
        shared: &Arc<Shared>,
        claim: Claim,
        job: JobDescriptor,
        permit: OwnedSemaphorePermit,
        completed: UnboundedSender<JobDescriptor>,
        watchers: &mut JoinSet<()>,
    ) {
        let job_id = job.id.clone();
        lock(&shared.in_flight).insert(claim.slot, job);
        let busy = shared.pool.counters().begin_job();
        debug!(
            slot = claim.slot,
            generation = claim.handle.generation(),
            job_id = %job_id,
            busy,
            "job dispatched"
        );
        watchers.spawn(watch_completion(shared.clone(), claim, permit, completed));
    }
}

/// A dispatcher running on a background task.
pub struct RunningDispatcher {
    stop: StopHandle,
    counters: Arc<PoolCounters>,
    task: JoinHandle<Result<PoolStats, DispatchError>>,
}

impl RunningDispatcher {
    /// Handle for requesting shutdown.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Request shutdown.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the dispatcher to drain and exit.
    pub async fn join(self) -> Result<PoolStats, DispatchError> {
        self.task.await?
    }
}

fn return_undispatched(completed: &UnboundedSender<JobDescriptor>, job: JobDescriptor) {
    info!(job_id = %job.id, "returning undispatched job");
    if completed.send(job).is_err() {
        error!("completed queue closed, undispatched job lost");
    }
}

async fn watch_completion(
    shared: Arc<Shared>,
    claim: Claim,
    permit: OwnedSemaphorePermit,
    completed: UnboundedSender<JobDescriptor>,
) {
    let Claim { slot, handle } = claim;
    let result = handle.get_result().await;
    let in_flight = lock(&shared.in_flight).remove(&slot);
    let worker_failed = result.is_err();

    let finished = match (result, in_flight) {
        (Ok(job), _) => Some(job),
        (Err(err), Some(mut job)) => {
            warn!(slot, job_id = %job.id, error = %err, "worker failed while running job");
            job.mark_failed();
            Some(job)
        }
        (Err(err), None) => {
            error!(slot, error = %err, "worker failed with no job in flight");
            None
        }
    };
    if let Some(job) = finished {
        debug!(slot, job_id = %job.id, outcome = ?job.outcome(), "job completed");
        if completed.send(job).is_err() {
            error!(slot, "completed queue closed, result lost");
        }
    }

    if (worker_failed || handle.is_one_time()) && !shared.stop.is_cancelled() {
        if let Err(err) = shared.pool.replace(slot, &handle).await {
            debug!(slot, error = %err, "slot left for replacement on next claim");
        }
    }

    let busy = shared.pool.counters().end_job();
    shared.pool.unclaim(slot);
    drop(permit);
    debug!(slot, busy, "slot released");
}

async fn receive_jobs(
    transport: SharedTransport,
    queue: String,
    unassigned: UnboundedSender<JobDescriptor>,
    stop: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            payload = transport.receive(&queue) => payload,
        };
        match payload {
            Ok(bytes) => match JobDescriptor::from_bytes(&bytes) {
                Ok(job) => {
                    debug!(job_id = %job.id, "job received");
                    if unassigned.send(job).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(queue = %queue, error = %err, "dropping malformed job descriptor"),
            },
            Err(err) => {
                error!(queue = %queue, error = %err, "inbound queue failed, stopping");
                stop.cancel();
                break;
            }
        }
    }
}

async fn listen_for_commands(transport: SharedTransport, queue: String, stop: CancellationToken) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            payload = transport.receive(&queue) => payload,
        };
        match payload {
            Ok(bytes) => match Command::from_bytes(&bytes) {
                Ok(Command::Stop) => {
                    info!("stop command received");
                    stop.cancel();
                    break;
                }
                Err(err) => warn!(queue = %queue, error = %err, "ignoring command"),
            },
            Err(err) => {
                error!(queue = %queue, error = %err, "command queue failed, stopping");
                stop.cancel();
                break;
            }
        }
    }
}

async fn send_results(
    transport: SharedTransport,
    queue: String,
    mut completed: UnboundedReceiver<JobDescriptor>,
) -> usize {
    let mut published = 0;
    while let Some(job) = completed.recv().await {
        match transport.publish(&queue, &job.to_bytes()).await {
            Ok(()) => {
                published += 1;
                debug!(job_id = %job.id, outcome = ?job.outcome(), "result published");
            }
            Err(err) => error!(queue = %queue, job_id = %job.id, error = %err, "failed to publish result"),
        }
    }
    published
}
