use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mutant_dispatch::dispatch::{
    CommandEngine, ConfigError, Coordinator, CoordinatorConfig, DispatchError, Dispatcher,
    DispatcherConfig, ExecLauncher, ExitStatusCode, JobDescriptor, ReportFormat, RunnerConfig,
    RunnerError, SharedTransport, SpoolTransport, Transport, TransportError, parse_flag,
    render_summary, serve, serve_benchmarks,
};
use mutant_dispatch::logging::{self, LogConfig};

#[derive(Debug, Parser)]
#[command(name = "mutant-dispatch")]
#[command(about = "Bounded worker-pool dispatcher for mutant test runs")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Dispatch jobs from an inbound queue to a pool of runners.
    Dispatcher(DispatcherArgs),
    /// Serve timed test runs on a private queue pair.
    Runner(RunnerArgs),
    /// Serve untimed baseline runs on a queue pair.
    Benchmarker(BenchmarkerArgs),
    /// Submit a file of jobs through a fresh dispatcher and print a summary.
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
struct DispatcherArgs {
    /// Queue jobs arrive on.
    inbound_queue: String,
    /// Queue results are published on.
    outbound_queue: String,
    /// Queue commands arrive on.
    command_queue: String,
    /// Number of worker slots.
    pool_size: usize,
    /// Maximum simultaneously busy workers.
    max_busy: usize,
    /// Workers exit after one job (True/False).
    #[arg(value_parser = parse_flag, action = clap::ArgAction::Set)]
    one_time: bool,
    /// Deadline multiplier applied to baselines.
    kill_time_factor: f64,
}

#[derive(Debug, Args)]
struct RunnerArgs {
    /// Queue jobs arrive on.
    inbound_queue: String,
    /// Queue results are published on.
    outbound_queue: String,
    /// Exit after one job (True/False).
    #[arg(value_parser = parse_flag, action = clap::ArgAction::Set)]
    one_time: bool,
    /// Deadline multiplier applied to baselines.
    kill_time_factor: f64,
}

#[derive(Debug, Args)]
struct BenchmarkerArgs {
    /// Queue jobs arrive on.
    inbound_queue: String,
    /// Queue results are published on.
    outbound_queue: String,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// JSON file holding an array of job descriptors.
    jobs: PathBuf,
    /// Number of worker slots.
    #[arg(long)]
    pool_size: Option<usize>,
    /// Maximum simultaneously busy workers.
    #[arg(long)]
    max_busy: Option<usize>,
    /// Replace workers after every job.
    #[arg(long)]
    one_time: bool,
    /// Deadline multiplier applied to baselines.
    #[arg(long, default_value_t = DispatcherConfig::DEFAULT_KILL_TIME_FACTOR)]
    kill_time_factor: f64,
    /// Output format.
    #[arg(long, value_enum, default_value = "md")]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

fn open_spool() -> Result<SharedTransport> {
    let spool = SpoolTransport::from_env().context("failed to open spool directory")?;
    debug!(root = %spool.root().display(), "spool opened");
    Ok(Arc::new(spool))
}

/// Cancel `token` on SIGINT or SIGTERM.
fn stop_on_interrupt(token: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || token.cancel()).context("failed to install interrupt handler")
}

async fn run_dispatcher(args: DispatcherArgs) -> Result<()> {
    let config = DispatcherConfig::default()
        .with_queues(args.inbound_queue, args.outbound_queue, args.command_queue)
        .with_pool_size(args.pool_size)
        .with_max_busy(args.max_busy)
        .with_one_time_runners(args.one_time)
        .with_kill_time_factor(args.kill_time_factor);
    config.validate()?;

    let transport = open_spool()?;
    let launcher = ExecLauncher::from_env().context("failed to locate runner executable")?;
    debug!(program = %launcher.program().display(), "runner program");
    let dispatcher = Dispatcher::new(config, transport, Arc::new(launcher));

    let stop = dispatcher.stop_handle();
    let interrupt = CancellationToken::new();
    stop_on_interrupt(interrupt.clone())?;
    tokio::spawn(async move {
        interrupt.cancelled().await;
        if !stop.is_stopped() {
            info!("interrupted, stopping dispatcher");
            stop.stop();
        }
    });

    let stats = dispatcher.run().await?;
    info!(
        jobs_completed = stats.jobs_completed,
        restarts = stats.restarts,
        peak_busy = stats.peak_busy,
        "dispatcher finished"
    );
    Ok(())
}

async fn run_runner(args: RunnerArgs) -> Result<()> {
    let config = RunnerConfig::new(args.inbound_queue, args.outbound_queue)
        .with_one_time(args.one_time)
        .with_kill_time_factor(args.kill_time_factor);
    config.validate()?;

    let transport = open_spool()?;
    let shutdown = CancellationToken::new();
    stop_on_interrupt(shutdown.clone())?;
    serve(transport, Arc::new(CommandEngine::from_env()), config, shutdown).await?;
    Ok(())
}

async fn run_benchmarker(args: BenchmarkerArgs) -> Result<()> {
    let config = RunnerConfig::new(args.inbound_queue, args.outbound_queue);
    let transport = open_spool()?;
    let shutdown = CancellationToken::new();
    stop_on_interrupt(shutdown.clone())?;
    serve_benchmarks(transport, Arc::new(CommandEngine::from_env()), config, shutdown).await?;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<()> {
    let raw = std::fs::read(&args.jobs)
        .with_context(|| format!("failed to read {}", args.jobs.display()))?;
    let jobs: Vec<JobDescriptor> = serde_json::from_slice(&raw)
        .map_err(|err| ConfigError::Invalid {
            name: "jobs",
            reason: err.to_string(),
        })?;

    let prefix = format!("submit-{}", std::process::id());
    let mut config = CoordinatorConfig::default()
        .with_queues(
            format!("{prefix}-in"),
            format!("{prefix}-out"),
            format!("{prefix}-cmd"),
        )
        .with_one_time_runners(args.one_time)
        .with_kill_time_factor(args.kill_time_factor);
    let pool_size = args.pool_size.unwrap_or(config.pool_size);
    config = config.with_parallelism(pool_size, args.max_busy.unwrap_or(pool_size));
    config.dispatcher_config().validate()?;

    let transport = open_spool()?;
    let queues = [
        config.inbound_queue.clone(),
        config.outbound_queue.clone(),
        config.command_queue.clone(),
    ];
    let outcome = submit_jobs(config, transport.clone(), &jobs).await;
    for queue in &queues {
        if let Err(err) = transport.delete(queue).await {
            warn!(queue = %queue, error = %err, "failed to delete submit queue");
        }
    }
    let results = outcome?;

    let format = match args.format {
        OutputFormat::Md => ReportFormat::Markdown,
        OutputFormat::Json => ReportFormat::Json,
    };
    println!("{}", render_summary(&results, format));
    Ok(())
}

/// Run `jobs` through a freshly launched dispatcher and collect every result.
async fn submit_jobs(
    config: CoordinatorConfig,
    transport: SharedTransport,
    jobs: &[JobDescriptor],
) -> Result<Vec<JobDescriptor>> {
    let mut coordinator = Coordinator::launch(config, transport).await?;
    for job in jobs {
        coordinator.send_job(job).await?;
    }
    let results = coordinator.drain().await?;
    let report = coordinator.shutdown().await?;
    info!(?report, "dispatcher shut down");
    Ok(results)
}

fn exit_code_for(err: &anyhow::Error) -> ExitStatusCode {
    if let Some(err) = err.downcast_ref::<DispatchError>() {
        return err.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return ExitStatusCode::BadArguments;
    }
    if err.downcast_ref::<TransportError>().is_some() || err.downcast_ref::<RunnerError>().is_some()
    {
        return ExitStatusCode::TransportSetup;
    }
    ExitStatusCode::Unexpected
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitStatusCode::Success.into();
        }
        Err(_) => return ExitStatusCode::BadArguments.into(),
    };
    logging::init(LogConfig::new().with_env_overrides());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start async runtime");
            return ExitStatusCode::Unexpected.into();
        }
    };

    let result = runtime.block_on(async {
        match cli.mode {
            Mode::Dispatcher(args) => run_dispatcher(args).await,
            Mode::Runner(args) => run_runner(args).await,
            Mode::Benchmarker(args) => run_benchmarker(args).await,
            Mode::Submit(args) => run_submit(args).await,
        }
    });

    match result {
        Ok(()) => ExitStatusCode::Success.into(),
        Err(err) => {
            error!(error = %format!("{err:#}"), "exiting after failure");
            exit_code_for(&err).into()
        }
    }
}
