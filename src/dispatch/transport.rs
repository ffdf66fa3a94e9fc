//! Named FIFO queues between producer, dispatcher and workers.
//!
//! Two implementations are provided:
//!
//! - [`MemoryTransport`]: in-process queues, for tests and in-process workers.
//! - [`SpoolTransport`]: one directory per queue under a shared root, one file
//!   per message. Consumers claim a message by renaming it, so several
//!   processes can compete on the same queue without double delivery.
//!   Filesystem work runs off the async worker threads.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

/// Environment variable naming the spool root shared by all processes.
pub const SPOOL_ENV: &str = "MUTANT_DISPATCH_SPOOL";

const SPOOL_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MESSAGE_SUFFIX: &str = ".msg";

static SPOOL_SEQUENCE: AtomicU64 = AtomicU64::new(0);
static SPOOL_LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Transport-level faults.
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Queue was never declared.
    #[error("queue {0} is not declared")]
    UnknownQueue(String),
    /// Queue was deleted while in use.
    #[error("queue {0} was deleted")]
    Deleted(String),
    /// Queue name cannot be used.
    #[error("invalid queue name {0:?}")]
    InvalidQueueName(String),
}

/// Send/receive primitive over named queues.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Create the queue if it does not exist yet.
    async fn declare(&self, queue: &str) -> Result<(), TransportError>;

    /// Append a message to a declared queue.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next message on a declared queue.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn receive(&self, queue: &str) -> Result<Vec<u8>, TransportError>;

    /// Remove the queue and fail any pending receivers.
    async fn delete(&self, queue: &str) -> Result<(), TransportError>;
}

/// Shared, type-erased transport.
pub type SharedTransport = Arc<dyn Transport>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_queue_name(queue: &str) -> Result<(), TransportError> {
    let valid = !queue.is_empty()
        && !queue.starts_with('.')
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidQueueName(queue.to_string()))
    }
}

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    deleted: AtomicBool,
    arrivals: Notify,
}

/// In-process transport.
#[derive(Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle to an empty transport.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of messages waiting on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        lock(&self.queues)
            .get(queue)
            .map(|q| lock(&q.messages).len())
            .unwrap_or(0)
    }

    fn queue(&self, queue: &str) -> Result<Arc<MemoryQueue>, TransportError> {
        lock(&self.queues)
            .get(queue)
            .cloned()
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        validate_queue_name(queue)?;
        lock(&self.queues)
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::default()));
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        let q = self.queue(queue)?;
        lock(&q.messages).push_back(payload.to_vec());
        q.arrivals.notify_one();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Vec<u8>, TransportError> {
        let q = self.queue(queue)?;
        loop {
            let notified = q.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if q.deleted.load(Ordering::SeqCst) {
                return Err(TransportError::Deleted(queue.to_string()));
            }
            if let Some(message) = lock(&q.messages).pop_front() {
                return Ok(message);
            }
            notified.await;
        }
    }

    async fn delete(&self, queue: &str) -> Result<(), TransportError> {
        let removed = lock(&self.queues).remove(queue);
        if let Some(q) = removed {
            q.deleted.store(true, Ordering::SeqCst);
            q.arrivals.notify_waiters();
        }
        Ok(())
    }
}

/// Cross-process transport backed by a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolTransport {
    root: PathBuf,
    poll_interval: Duration,
}

impl SpoolTransport {
    /// Use `root` as the spool directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            poll_interval: SPOOL_POLL_INTERVAL,
        })
    }

    /// Open the spool named by `MUTANT_DISPATCH_SPOOL`, or the default under the temp dir.
    pub fn from_env() -> Result<Self, TransportError> {
        Self::open(Self::default_root())
    }

    /// Spool root used when none is configured explicitly.
    pub fn default_root() -> PathBuf {
        std::env::var_os(SPOOL_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("mutant-dispatch-spool"))
    }

    /// Override how often idle receivers re-scan their queue.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spool root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf, TransportError> {
        validate_queue_name(queue)?;
        Ok(self.root.join(queue))
    }

    /// Ordering key for a new message file.
    ///
    /// Keys sort by a per-process monotonic stamp, so one producer's messages
    /// keep their order even if the wall clock steps backwards.
    fn message_key() -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let seq = SPOOL_SEQUENCE.fetch_add(1, Ordering::SeqCst);
        format!(
            "{:020}-{:010}-{seq:012}",
            next_stamp(now),
            std::process::id()
        )
    }

    /// Claim the oldest message, if any. Blocking.
    fn try_claim(dir: &Path, queue: &str) -> Result<Option<ClaimedMessage>, TransportError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::Deleted(queue.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(MESSAGE_SUFFIX))
            .collect();
        names.sort();

        for name in names {
            let original = dir.join(&name);
            let claimed = dir.join(format!(".claimed-{}", Self::message_key()));
            match std::fs::rename(&original, &claimed) {
                Ok(()) => {
                    let mut message = ClaimedMessage {
                        original,
                        claimed,
                        payload: Vec::new(),
                        accepted: false,
                    };
                    message.payload = std::fs::read(&message.claimed)?;
                    return Ok(Some(message));
                }
                // Another consumer won the race for this message.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }
}

/// Per-process monotonic stamp no lower than `now`.
fn next_stamp(now: u64) -> u64 {
    let mut stamp = now;
    let _ = SPOOL_LAST_STAMP.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        stamp = now.max(last.saturating_add(1));
        Some(stamp)
    });
    stamp
}

/// A message renamed out of its queue. Put back unless accepted.
struct ClaimedMessage {
    original: PathBuf,
    claimed: PathBuf,
    payload: Vec<u8>,
    accepted: bool,
}

impl ClaimedMessage {
    fn accept(mut self) -> Vec<u8> {
        self.accepted = true;
        let claimed = self.claimed.clone();
        tokio::task::spawn_blocking(move || std::fs::remove_file(claimed));
        std::mem::take(&mut self.payload)
    }
}

impl Drop for ClaimedMessage {
    fn drop(&mut self) {
        // The receiver went away before taking it.
        if !self.accepted {
            let _ = std::fs::rename(&self.claimed, &self.original);
        }
    }
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(self.queue_dir(queue)?).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        let dir = self.queue_dir(queue)?;
        let is_dir = tokio::fs::metadata(&dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }
        let key = Self::message_key();
        let staging = dir.join(format!(".staging-{key}"));
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, dir.join(format!("{key}{MESSAGE_SUFFIX}"))).await?;
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Vec<u8>, TransportError> {
        let dir = self.queue_dir(queue)?;
        loop {
            let (scan_dir, scan_queue) = (dir.clone(), queue.to_string());
            let claimed =
                tokio::task::spawn_blocking(move || Self::try_claim(&scan_dir, &scan_queue))
                    .await
                    .map_err(|err| TransportError::Io(std::io::Error::other(err)))??;
            if let Some(message) = claimed {
                return Ok(message.accept());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete(&self, queue: &str) -> Result<(), TransportError> {
        match tokio::fs::remove_dir_all(self.queue_dir(queue)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
