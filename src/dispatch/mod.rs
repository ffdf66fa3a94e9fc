//! Job dispatch over a bounded pool of out-of-process test runners.

pub mod benchmark;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod job;
pub mod pool;
pub mod process;
/// Human-readable and machine-friendly run summaries.
pub mod report;
pub mod runner;
pub mod transport;
pub mod worker;

pub use benchmark::{Benchmarker, TimeoutPolicy, run_timed};
pub use command::{Command, UnknownCommand};
pub use config::{ConfigError, CoordinatorConfig, DispatcherConfig, RunnerConfig, parse_flag};
pub use coordinator::Coordinator;
pub use dispatcher::{DispatchError, Dispatcher, RunningDispatcher, StopHandle};
pub use engine::{CommandEngine, EngineError, TestEngine, TestRun};
pub use job::{JobDescriptor, JobOutcome};
pub use pool::{PoolStats, WorkerPool};
pub use process::{ExitReport, ExitStatusCode, Subprocess};
pub use report::{ReportFormat, RunSummary, render_summary};
pub use runner::{RunnerError, serve, serve_benchmarks};
pub use transport::{MemoryTransport, SharedTransport, SpoolTransport, Transport, TransportError};
pub use worker::{ExecLauncher, InProcessLauncher, WorkerError, WorkerHandle, WorkerLauncher};
