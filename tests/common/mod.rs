#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mutant_dispatch::dispatch::{
    DispatcherConfig, EngineError, InProcessLauncher, JobDescriptor, MemoryTransport,
    TestEngine, TestRun, Transport,
};

/// What one scripted test run does.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Run for `duration`, then exit with `code`.
    Run { duration: Duration, code: i32 },
    /// Bring the runner down mid-run.
    Crash,
}

impl Script {
    pub fn pass_after(ms: u64) -> Self {
        Self::Run {
            duration: Duration::from_millis(ms),
            code: 0,
        }
    }

    pub fn fail_after(ms: u64) -> Self {
        Self::Run {
            duration: Duration::from_millis(ms),
            code: 1,
        }
    }
}

/// Test engine driven by per-artifact scripts.
///
/// Each artifact has a queue of scripts consumed run by run; the last one
/// repeats. Unscripted artifacts pass after a few milliseconds.
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<PathBuf, VecDeque<Script>>>,
    started: AtomicUsize,
    active: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            peak_active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn script(&self, artifact: &str, runs: Vec<Script>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(PathBuf::from(artifact), runs.into());
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn next_script(&self, artifact: &Path) -> Script {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        match scripts.get_mut(artifact) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("non-empty queue"),
            Some(queue) => queue.front().copied().unwrap_or(Script::pass_after(5)),
            None => Script::pass_after(5),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedRun {
    script: Script,
    started: tokio::time::Instant,
    exit_code: Option<i32>,
    _active: ActiveGuard,
}

#[async_trait]
impl TestRun for ScriptedRun {
    async fn wait_for_exit(&mut self, limit: Option<Duration>) -> Result<bool, EngineError> {
        let (duration, code) = match self.script {
            Script::Run { duration, code } => (duration, code),
            Script::Crash => panic!("scripted runner crash"),
        };
        let remaining = duration.saturating_sub(self.started.elapsed());
        match limit {
            Some(limit) if limit < remaining => {
                tokio::time::sleep(limit).await;
                Ok(false)
            }
            _ => {
                tokio::time::sleep(remaining).await;
                self.exit_code = Some(code);
                Ok(true)
            }
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    async fn kill(&mut self) {}
}

#[async_trait]
impl TestEngine for ScriptedEngine {
    async fn start(
        &self,
        assembly: &Path,
        _tests: &[String],
    ) -> Result<Box<dyn TestRun>, EngineError> {
        let script = self.next_script(assembly);
        self.started.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(ScriptedRun {
            script,
            started: tokio::time::Instant::now(),
            exit_code: None,
            _active: ActiveGuard(self.active.clone()),
        }))
    }
}

pub const IN: &str = "flow-in";
pub const OUT: &str = "flow-out";
pub const CMD: &str = "flow-cmd";

pub fn config(pool_size: usize, max_busy: usize) -> DispatcherConfig {
    DispatcherConfig::default()
        .with_queues(IN, OUT, CMD)
        .with_pool_size(pool_size)
        .with_max_busy(max_busy)
        .with_worker_queue_prefix("flow")
}

pub fn launcher(
    transport: &Arc<MemoryTransport>,
    engine: &Arc<ScriptedEngine>,
) -> Arc<InProcessLauncher> {
    Arc::new(InProcessLauncher::new(transport.clone(), engine.clone()))
}

pub async fn declare_dispatcher_queues(transport: &MemoryTransport) {
    for queue in [IN, OUT, CMD] {
        transport.declare(queue).await.expect("declare should work");
    }
}

pub async fn submit(transport: &MemoryTransport, job: &JobDescriptor) {
    transport
        .publish(IN, &job.to_bytes())
        .await
        .expect("publish should work");
}

pub async fn send_command(transport: &MemoryTransport, token: &str) {
    transport
        .publish(CMD, token.as_bytes())
        .await
        .expect("publish should work");
}

/// Receive `count` results from the outbound queue.
pub async fn collect(transport: &MemoryTransport, count: usize) -> Vec<JobDescriptor> {
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = tokio::time::timeout(Duration::from_secs(10), transport.receive(OUT))
            .await
            .expect("result should arrive in time")
            .expect("receive should work");
        results.push(JobDescriptor::from_bytes(&raw).expect("result should decode"));
    }
    results
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Every submitted id appears exactly once among the results, and nothing else does.
pub fn assert_ids_match_once(submitted: &[JobDescriptor], results: &[JobDescriptor]) {
    let expected: HashSet<&str> = submitted.iter().map(|job| job.id.as_str()).collect();
    let mut seen = HashSet::new();
    for result in results {
        assert!(
            expected.contains(result.id.as_str()),
            "unexpected result id {}",
            result.id
        );
        assert!(seen.insert(result.id.as_str()), "duplicate result {}", result.id);
    }
    assert_eq!(seen.len(), expected.len(), "missing results");
}

pub fn find<'a>(results: &'a [JobDescriptor], id: &str) -> &'a JobDescriptor {
    results
        .iter()
        .find(|job| job.id == id)
        .unwrap_or_else(|| panic!("no result for {id}"))
}
