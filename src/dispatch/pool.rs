//! Fixed-size pool of worker slots.
//!
//! Each slot holds the current [`WorkerHandle`] behind an async mutex, so a
//! replacement and a reader of the same slot never interleave, plus a claim
//! flag marking the slot as reserved for a dispatch or an in-flight job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::config::DispatcherConfig;
use super::transport::SharedTransport;
use super::worker::{WorkerError, WorkerHandle, WorkerLauncher};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of worker slots.
    pub worker_count: usize,
    /// Jobs currently in flight.
    pub busy: usize,
    /// Highest busy count observed.
    pub peak_busy: usize,
    /// Workers replaced after dying, being killed or finishing a one-time job.
    pub restarts: u64,
    /// Jobs whose result (real or forced) was collected.
    pub jobs_completed: u64,
}

/// Counters shared between the pool, the dispatcher and observers.
#[derive(Debug, Default)]
pub struct PoolCounters {
    workers: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
    restarts: AtomicU64,
    jobs_completed: AtomicU64,
}

impl PoolCounters {
    /// Record a job going in flight; returns the new busy count.
    pub fn begin_job(&self) -> usize {
        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_busy.fetch_max(busy, Ordering::SeqCst);
        busy
    }

    /// Record a job leaving flight; returns the new busy count.
    pub fn end_job(&self) -> usize {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.busy.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            worker_count: self.workers.load(Ordering::SeqCst),
            busy: self.busy.load(Ordering::SeqCst),
            peak_busy: self.peak_busy.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
        }
    }
}

struct Slot {
    handle: Mutex<Arc<WorkerHandle>>,
    claimed: AtomicBool,
}

/// A worker reserved for one dispatch.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Slot index in pool order.
    pub slot: usize,
    /// Worker occupying the slot at claim time.
    pub handle: Arc<WorkerHandle>,
}

/// Fixed set of worker slots.
pub struct WorkerPool {
    slots: Vec<Slot>,
    config: DispatcherConfig,
    transport: SharedTransport,
    launcher: Arc<dyn WorkerLauncher>,
    counters: Arc<PoolCounters>,
    idle: Notify,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Launch `config.pool_size` workers.
    pub async fn start(
        config: DispatcherConfig,
        transport: SharedTransport,
        launcher: Arc<dyn WorkerLauncher>,
        counters: Arc<PoolCounters>,
    ) -> Result<Self, WorkerError> {
        let mut slots = Vec::with_capacity(config.pool_size);
        for slot in 0..config.pool_size {
            let handle =
                WorkerHandle::spawn(slot, 0, &config, transport.clone(), launcher.as_ref()).await?;
            slots.push(Slot {
                handle: Mutex::new(Arc::new(handle)),
                claimed: AtomicBool::new(false),
            });
        }
        counters.workers.store(slots.len(), Ordering::SeqCst);
        info!(workers = slots.len(), "worker pool started");

        Ok(Self {
            slots,
            config,
            transport,
            launcher,
            counters,
            idle: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for a pool without slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Shared counters.
    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    /// Current worker in `slot`.
    pub async fn handle(&self, slot: usize) -> Option<Arc<WorkerHandle>> {
        match self.slots.get(slot) {
            Some(s) => Some(s.handle.lock().await.clone()),
            None => None,
        }
    }

    /// Wait for the first idle slot in pool order and reserve it.
    ///
    /// A retired worker found in the claimed slot is replaced first.
    pub async fn claim(&self) -> Result<Claim, WorkerError> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.try_reserve() {
                return self.prepare(slot).await;
            }
            notified.await;
        }
    }

    fn try_reserve(&self) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    async fn prepare(&self, slot: usize) -> Result<Claim, WorkerError> {
        let current = self.slots[slot].handle.lock().await.clone();
        if !current.is_retired() {
            return Ok(Claim {
                slot,
                handle: current,
            });
        }
        debug!(slot, generation = current.generation(), "claimed slot holds a retired worker");
        if let Err(err) = self.replace(slot, &current).await {
            self.unclaim(slot);
            return Err(err);
        }
        let handle = self.slots[slot].handle.lock().await.clone();
        Ok(Claim { slot, handle })
    }

    /// Kill `stale` and put a fresh worker in its slot.
    ///
    /// Does nothing when the slot already holds a newer worker, or once the
    /// pool is closed. On launch failure the slot keeps the dead worker and
    /// the next claim retries.
    pub async fn replace(&self, slot: usize, stale: &Arc<WorkerHandle>) -> Result<(), WorkerError> {
        let Some(entry) = self.slots.get(slot) else {
            return Ok(());
        };
        let mut guard = entry.handle.lock().await;
        if !Arc::ptr_eq(&*guard, stale) {
            return Ok(());
        }
        guard.kill().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let generation = guard.generation() + 1;
        match WorkerHandle::spawn(
            slot,
            generation,
            &self.config,
            self.transport.clone(),
            self.launcher.as_ref(),
        )
        .await
        {
            Ok(fresh) => {
                *guard = Arc::new(fresh);
                self.counters.restarts.fetch_add(1, Ordering::SeqCst);
                debug!(slot, generation, "worker replaced");
                Ok(())
            }
            Err(err) => {
                warn!(slot, generation, error = %err, "failed to launch replacement worker");
                Err(err)
            }
        }
    }

    /// Give back a reservation without completing a job.
    pub fn unclaim(&self, slot: usize) {
        if let Some(entry) = self.slots.get(slot) {
            entry.claimed.store(false, Ordering::SeqCst);
            self.idle.notify_waiters();
        }
    }

    /// Number of slots currently reserved.
    pub fn claimed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.claimed.load(Ordering::SeqCst))
            .count()
    }

    /// Close the pool and kill every worker. Later replacements are skipped.
    pub async fn kill_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for slot in &self.slots {
            slot.handle.lock().await.kill().await;
        }
        self.idle.notify_waiters();
        info!(workers = self.slots.len(), "worker pool stopped");
    }

    /// True once [`WorkerPool::kill_all`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
