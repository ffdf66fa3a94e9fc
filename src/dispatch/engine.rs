//! Test-execution engine abstraction and the command-line adapter.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Environment variable naming an optional wrapper program for test runs.
pub const ENGINE_ENV: &str = "MUTANT_DISPATCH_ENGINE";

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The test run could not be started.
    #[error("failed to start test run for {}: {source}", path.display())]
    Start {
        /// Artifact that failed to start.
        path: PathBuf,
        /// Underlying spawn failure.
        #[source]
        source: std::io::Error,
    },
    /// IO failure while supervising a run.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Starts test runs against mutant artifacts.
#[async_trait]
pub trait TestEngine: Send + Sync + 'static {
    /// Start running `tests` (all tests when empty) against `assembly`.
    async fn start(
        &self,
        assembly: &Path,
        tests: &[String],
    ) -> Result<Box<dyn TestRun>, EngineError>;
}

/// One started test run.
#[async_trait]
pub trait TestRun: Send {
    /// Wait for the run to exit. `None` waits without limit.
    ///
    /// Returns `false` when `limit` elapsed before the run exited.
    async fn wait_for_exit(&mut self, limit: Option<Duration>) -> Result<bool, EngineError>;

    /// Exit code, once exited.
    fn exit_code(&self) -> Option<i32>;

    /// Force the run to stop. Never fails.
    async fn kill(&mut self);
}

/// Runs the artifact as a test harness executable.
///
/// Without a wrapper the artifact itself is executed with the selected test
/// names as exact filters. With a wrapper, the wrapper receives the artifact
/// path followed by the test names.
#[derive(Debug, Clone, Default)]
pub struct CommandEngine {
    wrapper: Option<PathBuf>,
}

impl CommandEngine {
    /// Execute artifacts directly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the wrapper named by `MUTANT_DISPATCH_ENGINE`, if set.
    pub fn from_env() -> Self {
        let mut engine = Self::new();
        if let Some(wrapper) = std::env::var_os(ENGINE_ENV).filter(|w| !w.is_empty()) {
            engine = engine.with_wrapper(wrapper);
        }
        engine
    }

    /// Run artifacts through `wrapper`.
    pub fn with_wrapper(mut self, wrapper: impl Into<PathBuf>) -> Self {
        self.wrapper = Some(wrapper.into());
        self
    }

    fn build_command(&self, assembly: &Path, tests: &[String]) -> Command {
        let mut cmd = match &self.wrapper {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(assembly).args(tests);
                cmd
            }
            None => {
                let mut cmd = Command::new(assembly);
                if !tests.is_empty() {
                    cmd.arg("--exact").args(tests);
                }
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TestEngine for CommandEngine {
    async fn start(
        &self,
        assembly: &Path,
        tests: &[String],
    ) -> Result<Box<dyn TestRun>, EngineError> {
        let child = self
            .build_command(assembly, tests)
            .spawn()
            .map_err(|source| EngineError::Start {
                path: assembly.to_path_buf(),
                source,
            })?;
        Ok(Box::new(CommandRun {
            child,
            status: None,
        }))
    }
}

struct CommandRun {
    child: Child,
    status: Option<ExitStatus>,
}

#[async_trait]
impl TestRun for CommandRun {
    async fn wait_for_exit(&mut self, limit: Option<Duration>) -> Result<bool, EngineError> {
        if self.status.is_some() {
            return Ok(true);
        }
        let status = match limit {
            None => self.child.wait().await?,
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(false),
            },
        };
        self.status = Some(status);
        Ok(true)
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script should be written");
        std::fs::set_permissions(&path, PermissionsExt::from_mode(0o755))
            .expect("script should be executable");
        path
    }

    #[tokio::test]
    async fn direct_run_reports_exit_code() {
        let tmp = tempdir().expect("tempdir should be created");
        let failing = script(tmp.path(), "failing", "exit 4");

        let mut run = CommandEngine::new()
            .start(&failing, &[])
            .await
            .expect("run should start");
        assert!(run.wait_for_exit(None).await.expect("wait should work"));
        assert_eq!(run.exit_code(), Some(4));
    }

    #[tokio::test]
    async fn selected_tests_are_passed_as_exact_filters() {
        let tmp = tempdir().expect("tempdir should be created");
        let harness = script(
            tmp.path(),
            "harness",
            r#"[ "$1" = "--exact" ] && [ "$2" = "a::b" ] && [ "$3" = "c" ]"#,
        );

        let mut run = CommandEngine::new()
            .start(&harness, &["a::b".to_string(), "c".to_string()])
            .await
            .expect("run should start");
        run.wait_for_exit(None).await.expect("wait should work");
        assert_eq!(run.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn wrapper_receives_artifact_path_first() {
        let tmp = tempdir().expect("tempdir should be created");
        let wrapper = script(tmp.path(), "wrapper", r#"[ "$1" = "/mutants/m1" ] && [ "$2" = "t1" ]"#);

        let mut run = CommandEngine::new()
            .with_wrapper(&wrapper)
            .start(Path::new("/mutants/m1"), &["t1".to_string()])
            .await
            .expect("run should start");
        run.wait_for_exit(None).await.expect("wait should work");
        assert_eq!(run.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn limit_elapses_before_hung_run_exits() {
        let tmp = tempdir().expect("tempdir should be created");
        let hung = script(tmp.path(), "hung", "sleep 30");

        let mut run = CommandEngine::new()
            .start(&hung, &[])
            .await
            .expect("run should start");
        let exited = run
            .wait_for_exit(Some(Duration::from_millis(50)))
            .await
            .expect("wait should work");
        assert!(!exited);
        assert_eq!(run.exit_code(), None);
        run.kill().await;
    }

    #[tokio::test]
    async fn missing_artifact_is_a_start_error() {
        let result = CommandEngine::new()
            .start(Path::new("/definitely/not/here"), &[])
            .await;
        assert!(matches!(result, Err(EngineError::Start { .. })));
    }
}
