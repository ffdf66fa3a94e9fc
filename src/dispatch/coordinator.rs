//! Producer-side front end for a dispatcher process.

use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::command::Command;
use super::config::CoordinatorConfig;
use super::dispatcher::DispatchError;
use super::job::JobDescriptor;
use super::process::{ExitReport, Subprocess};
use super::transport::SharedTransport;

const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Sends jobs to a dispatcher and collects its results.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: SharedTransport,
    dispatcher: Subprocess,
    sent: u64,
    received: u64,
}

impl Coordinator {
    /// Subcommand the dispatcher program must understand.
    pub const DISPATCHER_SUBCOMMAND: &'static str = "dispatcher";

    /// Declare the queue triple and launch the dispatcher as an OS process.
    pub async fn launch(
        config: CoordinatorConfig,
        transport: SharedTransport,
    ) -> Result<Self, DispatchError> {
        let program = match &config.dispatcher_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(DispatchError::Launch)?,
        };
        declare_queues(&config, &transport).await?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.arg(Self::DISPATCHER_SUBCOMMAND)
            .args(config.dispatcher_config().to_launch_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let dispatcher = Subprocess::spawn_command(cmd).map_err(DispatchError::Launch)?;
        info!(program = %program.display(), pid = ?dispatcher.id(), "dispatcher launched");

        Ok(Self::from_parts(config, transport, dispatcher))
    }

    /// Declare the queue triple and adopt an already running dispatcher.
    pub async fn attach(
        config: CoordinatorConfig,
        transport: SharedTransport,
        dispatcher: Subprocess,
    ) -> Result<Self, DispatchError> {
        declare_queues(&config, &transport).await?;
        Ok(Self::from_parts(config, transport, dispatcher))
    }

    fn from_parts(config: CoordinatorConfig, transport: SharedTransport, dispatcher: Subprocess) -> Self {
        Self {
            config,
            transport,
            dispatcher,
            sent: 0,
            received: 0,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Queue a job for dispatch.
    pub async fn send_job(&mut self, job: &JobDescriptor) -> Result<(), DispatchError> {
        self.transport
            .publish(&self.config.outbound_queue, &job.to_bytes())
            .await?;
        self.sent += 1;
        debug!(job_id = %job.id, pending = self.pending(), "job sent");
        Ok(())
    }

    /// Wait for the next result, in completion order.
    ///
    /// Fails once the dispatcher has exited and no result is left.
    pub async fn next_result(&mut self) -> Result<JobDescriptor, DispatchError> {
        let queue = self.config.inbound_queue.as_str();
        let payload = tokio::select! {
            biased;
            received = self.transport.receive(queue) => received?,
            report = self.dispatcher.exited() => {
                match tokio::time::timeout(EXIT_DRAIN, self.transport.receive(queue)).await {
                    Ok(received) => received?,
                    Err(_) => return Err(DispatchError::DispatcherExited(report)),
                }
            }
        };
        let job = JobDescriptor::from_bytes(&payload)?;
        self.received += 1;
        Ok(job)
    }

    /// Collect results until every sent job has answered.
    pub async fn drain(&mut self) -> Result<Vec<JobDescriptor>, DispatchError> {
        let mut results = Vec::new();
        while self.pending() > 0 {
            results.push(self.next_result().await?);
        }
        Ok(results)
    }

    /// Jobs sent without a result yet.
    pub fn pending(&self) -> u64 {
        self.sent.saturating_sub(self.received)
    }

    /// Jobs sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Results received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Send `stop` and wait briefly for the dispatcher.
    ///
    /// A lingering dispatcher is asked to terminate, which lets it kill its
    /// runners, and is killed outright after a second `exit_wait`.
    pub async fn shutdown(self) -> Result<ExitReport, DispatchError> {
        self.transport
            .publish(&self.config.command_queue, Command::Stop.as_str().as_bytes())
            .await?;
        let report = match self.dispatcher.wait_timeout(self.config.exit_wait).await {
            Some(report) => report,
            None => {
                warn!(
                    wait_ms = self.config.exit_wait.as_millis() as u64,
                    "dispatcher did not exit in time, terminating it"
                );
                self.dispatcher.terminate(self.config.exit_wait).await
            }
        };
        if report.success() {
            info!(?report, "dispatcher exited");
        } else {
            warn!(?report, "dispatcher exited abnormally");
        }
        Ok(report)
    }
}

async fn declare_queues(
    config: &CoordinatorConfig,
    transport: &SharedTransport,
) -> Result<(), DispatchError> {
    for queue in [
        &config.inbound_queue,
        &config.outbound_queue,
        &config.command_queue,
    ] {
        transport.declare(queue).await?;
    }
    Ok(())
}
