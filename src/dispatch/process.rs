//! Supervised child processes.
//!
//! A [`Subprocess`] is either a real OS process or an in-process task standing
//! in for one. Both expose the same lifecycle: wait for exit, check for exit,
//! and a best-effort, idempotent kill.
//!
//! On unix an OS process leads its own process group. Killing it kills the
//! whole group, so test runs started by a runner never outlive it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    /// Exited on its own with a status code.
    Code(i32),
    /// Terminated by a signal it did not ask for.
    Signalled,
    /// Terminated through [`Subprocess::kill`].
    Killed,
    /// In-process stand-in panicked.
    Panicked,
    /// Exit status could not be collected.
    Unknown,
}

impl ExitReport {
    fn from_status(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Code(code),
            None => Self::Signalled,
        }
    }

    /// True for a zero exit code.
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

/// Exit codes of the dispatcher, runner and benchmarker modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatusCode {
    /// Clean exit.
    Success = 0,
    /// Wrong number or shape of launch arguments.
    BadArguments = 1,
    /// Queues could not be opened or declared.
    TransportSetup = 2,
    /// Any other fault.
    Unexpected = 3,
}

impl ExitStatusCode {
    /// Numeric process exit code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Interpret an exit report produced by one of these modes.
    pub fn from_report(report: ExitReport) -> Option<Self> {
        match report {
            ExitReport::Code(0) => Some(Self::Success),
            ExitReport::Code(1) => Some(Self::BadArguments),
            ExitReport::Code(2) => Some(Self::TransportSetup),
            ExitReport::Code(3) => Some(Self::Unexpected),
            _ => None,
        }
    }
}

impl From<ExitStatusCode> for std::process::ExitCode {
    fn from(code: ExitStatusCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

/// Handle to a supervised child.
#[derive(Debug)]
pub struct Subprocess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitReport>>,
    kill: CancellationToken,
}

impl Subprocess {
    /// Spawn an OS process. It is killed when the handle is killed or the runtime shuts down.
    ///
    /// Whatever is left of its process group is killed once it exits.
    pub fn spawn_command(mut command: tokio::process::Command) -> std::io::Result<Self> {
        command.kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;
        let pid = child.id();
        let (tx, exit) = watch::channel(None);
        let kill = CancellationToken::new();
        let token = kill.clone();

        tokio::spawn(async move {
            let report = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ExitReport::from_status(status),
                    Err(_) => ExitReport::Unknown,
                },
                _ = token.cancelled() => {
                    signal_group(pid, GroupSignal::Kill);
                    let _ = child.kill().await;
                    ExitReport::Killed
                }
            };
            signal_group(pid, GroupSignal::Kill);
            let _ = tx.send(Some(report));
        });

        Ok(Self { pid, exit, kill })
    }

    /// Run `future` as an in-process stand-in; its output is the exit code.
    pub fn spawn_task<F>(future: F) -> Self
    where
        F: Future<Output = i32> + Send + 'static,
    {
        let mut handle = tokio::spawn(future);
        let (tx, exit) = watch::channel(None);
        let kill = CancellationToken::new();
        let token = kill.clone();

        tokio::spawn(async move {
            let report = tokio::select! {
                joined = &mut handle => match joined {
                    Ok(code) => ExitReport::Code(code),
                    Err(err) if err.is_panic() => ExitReport::Panicked,
                    Err(_) => ExitReport::Killed,
                },
                _ = token.cancelled() => {
                    handle.abort();
                    ExitReport::Killed
                }
            };
            let _ = tx.send(Some(report));
        });

        Self {
            pid: None,
            exit,
            kill,
        }
    }

    /// OS process id, when this is a real process.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit report, if the child has already ended.
    pub fn try_exit(&self) -> Option<ExitReport> {
        *self.exit.borrow()
    }

    /// True once the child has ended.
    pub fn has_exited(&self) -> bool {
        self.try_exit().is_some()
    }

    /// Wait for the child to end.
    pub async fn exited(&self) -> ExitReport {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(report) => (*report).unwrap_or(ExitReport::Unknown),
            Err(_) => self.try_exit().unwrap_or(ExitReport::Unknown),
        }
    }

    /// Wait at most `limit` for the child to end.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<ExitReport> {
        tokio::time::timeout(limit, self.exited()).await.ok()
    }

    /// Terminate the child. Killing an already-dead child is not an error.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Ask the child to exit, killing it if it is still alive after `grace`.
    ///
    /// OS processes get SIGTERM on their process group first; in-process
    /// tasks are killed straight away.
    pub async fn terminate(&self, grace: Duration) -> ExitReport {
        if let Some(report) = self.try_exit() {
            return report;
        }
        if signal_group(self.pid, GroupSignal::Terminate) {
            if let Some(report) = self.wait_timeout(grace).await {
                return report;
            }
        }
        self.kill();
        self.exited().await
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`. Returns false when nothing was signalled.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    killpg(Pid::from_raw(pid), signal).is_ok()
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) -> bool {
    false
}
