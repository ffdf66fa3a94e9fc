//! Dispatcher, runner and coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A textual boolean was neither `True` nor `False`.
    #[error("expected True or False, got {0:?}")]
    InvalidFlag(String),
    /// A setting is out of range.
    #[error("invalid {name}: {reason}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Parse the textual booleans used on launch command lines.
pub fn parse_flag(raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "True" | "true" => Ok(true),
        "False" | "false" => Ok(false),
        other => Err(ConfigError::InvalidFlag(other.to_string())),
    }
}

/// Render a boolean the way launch command lines expect it.
pub fn format_flag(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn validate_factor(kill_time_factor: f64) -> Result<(), ConfigError> {
    if kill_time_factor.is_finite() && kill_time_factor > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            name: "kill_time_factor",
            reason: format!("must be a positive number, got {kill_time_factor}"),
        })
    }
}

/// Configuration of one runner (worker) process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Queue the runner receives jobs on.
    pub inbound_queue: String,
    /// Queue the runner publishes results on.
    pub outbound_queue: String,
    /// Exit after a single job.
    pub one_time: bool,
    /// Multiplier applied to baselines to derive deadlines.
    pub kill_time_factor: f64,
}

impl RunnerConfig {
    /// Runner listening on `inbound_queue` and answering on `outbound_queue`.
    pub fn new(inbound_queue: impl Into<String>, outbound_queue: impl Into<String>) -> Self {
        Self {
            inbound_queue: inbound_queue.into(),
            outbound_queue: outbound_queue.into(),
            one_time: false,
            kill_time_factor: DispatcherConfig::DEFAULT_KILL_TIME_FACTOR,
        }
    }

    /// Set one-time mode.
    pub fn with_one_time(mut self, one_time: bool) -> Self {
        self.one_time = one_time;
        self
    }

    /// Set the kill-time factor.
    pub fn with_kill_time_factor(mut self, kill_time_factor: f64) -> Self {
        self.kill_time_factor = kill_time_factor;
        self
    }

    /// Positional launch arguments: inbound, outbound, one-time flag, factor.
    pub fn to_launch_args(&self) -> Vec<String> {
        vec![
            self.inbound_queue.clone(),
            self.outbound_queue.clone(),
            format_flag(self.one_time).to_string(),
            self.kill_time_factor.to_string(),
        ]
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_factor(self.kill_time_factor)
    }
}

/// Configuration of a dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Queue jobs arrive on.
    pub inbound_queue: String,
    /// Queue results are published on.
    pub outbound_queue: String,
    /// Queue commands arrive on.
    pub command_queue: String,
    /// Number of worker slots.
    pub pool_size: usize,
    /// Maximum number of simultaneously busy workers.
    pub max_busy: usize,
    /// Workers exit after one job and are replaced.
    pub one_time_runners: bool,
    /// Multiplier applied to baselines to derive deadlines.
    pub kill_time_factor: f64,
    /// Prefix for private worker queue names.
    pub worker_queue_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            inbound_queue: "dispatcher-in".to_string(),
            outbound_queue: "dispatcher-out".to_string(),
            command_queue: "dispatcher-cmd".to_string(),
            pool_size,
            max_busy: pool_size,
            one_time_runners: false,
            kill_time_factor: Self::DEFAULT_KILL_TIME_FACTOR,
            worker_queue_prefix: format!("runner-{}", std::process::id()),
        }
    }
}

impl DispatcherConfig {
    /// Kill-time factor used when none is configured.
    pub const DEFAULT_KILL_TIME_FACTOR: f64 = 2.0;

    /// Set the inbound/outbound/command queue names.
    pub fn with_queues(
        mut self,
        inbound: impl Into<String>,
        outbound: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        self.inbound_queue = inbound.into();
        self.outbound_queue = outbound.into();
        self.command_queue = command.into();
        self
    }

    /// Set the number of worker slots.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the busy-worker cap.
    pub fn with_max_busy(mut self, max_busy: usize) -> Self {
        self.max_busy = max_busy;
        self
    }

    /// Set one-time runner mode.
    pub fn with_one_time_runners(mut self, one_time: bool) -> Self {
        self.one_time_runners = one_time;
        self
    }

    /// Set the kill-time factor.
    pub fn with_kill_time_factor(mut self, kill_time_factor: f64) -> Self {
        self.kill_time_factor = kill_time_factor;
        self
    }

    /// Set the private worker queue prefix.
    pub fn with_worker_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_queue_prefix = prefix.into();
        self
    }

    /// Runner configuration for the worker in `slot`, generation `generation`.
    pub fn runner_config(&self, slot: usize, generation: u64) -> RunnerConfig {
        let base = format!("{}-worker-{slot}-g{generation}", self.worker_queue_prefix);
        RunnerConfig::new(format!("{base}-in"), format!("{base}-out"))
            .with_one_time(self.one_time_runners)
            .with_kill_time_factor(self.kill_time_factor)
    }

    /// Positional launch arguments, in command-line order.
    pub fn to_launch_args(&self) -> Vec<String> {
        vec![
            self.inbound_queue.clone(),
            self.outbound_queue.clone(),
            self.command_queue.clone(),
            self.pool_size.to_string(),
            self.max_busy.to_string(),
            format_flag(self.one_time_runners).to_string(),
            self.kill_time_factor.to_string(),
        ]
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid {
                name: "pool_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_busy == 0 {
            return Err(ConfigError::Invalid {
                name: "max_busy",
                reason: "must be at least 1".to_string(),
            });
        }
        validate_factor(self.kill_time_factor)
    }
}

/// Configuration of the producer-side coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Queue results arrive on (the dispatcher's outbound queue).
    pub inbound_queue: String,
    /// Queue jobs are sent on (the dispatcher's inbound queue).
    pub outbound_queue: String,
    /// Queue commands are sent on.
    pub command_queue: String,
    /// Number of worker slots the dispatcher runs.
    pub pool_size: usize,
    /// Busy-worker cap for the dispatcher.
    pub max_busy: usize,
    /// Whether dispatcher workers are one-time.
    pub one_time_runners: bool,
    /// Kill-time factor forwarded to the dispatcher.
    pub kill_time_factor: f64,
    /// Dispatcher executable; defaults to the current executable.
    pub dispatcher_program: Option<PathBuf>,
    /// How long shutdown waits for the dispatcher to exit.
    pub exit_wait: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            inbound_queue: "coordinator-in".to_string(),
            outbound_queue: "coordinator-out".to_string(),
            command_queue: "coordinator-cmd".to_string(),
            pool_size: dispatcher.pool_size,
            max_busy: dispatcher.max_busy,
            one_time_runners: dispatcher.one_time_runners,
            kill_time_factor: dispatcher.kill_time_factor,
            dispatcher_program: None,
            exit_wait: Duration::from_millis(1000),
        }
    }
}

impl CoordinatorConfig {
    /// Set the queue names.
    pub fn with_queues(
        mut self,
        inbound: impl Into<String>,
        outbound: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        self.inbound_queue = inbound.into();
        self.outbound_queue = outbound.into();
        self.command_queue = command.into();
        self
    }

    /// Set pool size and busy cap.
    pub fn with_parallelism(mut self, pool_size: usize, max_busy: usize) -> Self {
        self.pool_size = pool_size;
        self.max_busy = max_busy;
        self
    }

    /// Set one-time runner mode.
    pub fn with_one_time_runners(mut self, one_time: bool) -> Self {
        self.one_time_runners = one_time;
        self
    }

    /// Set the kill-time factor.
    pub fn with_kill_time_factor(mut self, kill_time_factor: f64) -> Self {
        self.kill_time_factor = kill_time_factor;
        self
    }

    /// Set the dispatcher executable.
    pub fn with_dispatcher_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.dispatcher_program = Some(program.into());
        self
    }

    /// Dispatcher configuration mirroring this coordinator's queues.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_queues(
                self.outbound_queue.clone(),
                self.inbound_queue.clone(),
                self.command_queue.clone(),
            )
            .with_pool_size(self.pool_size)
            .with_max_busy(self.max_busy)
            .with_one_time_runners(self.one_time_runners)
            .with_kill_time_factor(self.kill_time_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_use_textual_booleans() {
        assert_eq!(parse_flag("True"), Ok(true));
        assert_eq!(parse_flag("False"), Ok(false));
        assert_eq!(format_flag(true), "True");
        assert!(matches!(parse_flag("yes"), Err(ConfigError::InvalidFlag(_))));
    }

    #[test]
    fn dispatcher_launch_args_are_positional() {
        let cfg = DispatcherConfig::default()
            .with_queues("in", "out", "cmd")
            .with_pool_size(4)
            .with_max_busy(2)
            .with_one_time_runners(true)
            .with_kill_time_factor(1.5);
        assert_eq!(
            cfg.to_launch_args(),
            vec!["in", "out", "cmd", "4", "2", "True", "1.5"]
        );
    }

    #[test]
    fn worker_queues_are_unique_per_generation() {
        let cfg = DispatcherConfig::default().with_worker_queue_prefix("p");
        let first = cfg.runner_config(1, 0);
        let replacement = cfg.runner_config(1, 1);
        assert_eq!(first.inbound_queue, "p-worker-1-g0-in");
        assert_eq!(first.outbound_queue, "p-worker-1-g0-out");
        assert_ne!(first.inbound_queue, replacement.inbound_queue);
        assert_eq!(
            replacement.to_launch_args(),
            vec!["p-worker-1-g1-in", "p-worker-1-g1-out", "False", "2"]
        );
    }

    #[test]
    fn validation_rejects_empty_pools_and_bad_factors() {
        assert!(DispatcherConfig::default().with_pool_size(0).validate().is_err());
        assert!(DispatcherConfig::default().with_max_busy(0).validate().is_err());
        assert!(
            DispatcherConfig::default()
                .with_kill_time_factor(f64::NAN)
                .validate()
                .is_err()
        );
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn coordinator_mirrors_queues_for_dispatcher() {
        let cfg = CoordinatorConfig::default()
            .with_queues("c-in", "c-out", "c-cmd")
            .with_parallelism(3, 2);
        let dispatcher = cfg.dispatcher_config();
        assert_eq!(dispatcher.inbound_queue, "c-out");
        assert_eq!(dispatcher.outbound_queue, "c-in");
        assert_eq!(dispatcher.command_queue, "c-cmd");
        assert_eq!(dispatcher.pool_size, 3);
        assert_eq!(dispatcher.max_busy, 2);
        assert_eq!(cfg.exit_wait, Duration::from_secs(1));
    }
}
