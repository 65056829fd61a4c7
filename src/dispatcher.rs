use crate::config::{Config, MAX_WORKERS};
use crate::error::{Result, TileError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared lifecycle flag of one load: `Queued`, then exactly one of
/// `Running` or `Cancelled`.
#[derive(Debug, Clone)]
pub struct JobTicket(Arc<AtomicU8>);

impl JobTicket {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(QUEUED)))
    }

    /// Moves a queued job to running. False if it was cancelled first.
    pub fn start(&self) -> bool {
        match self
            .0
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == RUNNING,
        }
    }

    /// Cancels a job that has not started. False if it is already running.
    pub fn cancel(&self) -> bool {
        match self
            .0
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(state) => state == CANCELLED,
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }

    pub fn same_as(&self, other: &JobTicket) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for JobTicket {
    fn default() -> Self {
        Self::new()
    }
}

pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A unit of work plus the ticket that decides whether it may still run.
pub struct Job {
    ticket: JobTicket,
    task: BoxedTask,
}

impl Job {
    pub fn new(ticket: JobTicket, task: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            ticket,
            task: Box::pin(task),
        }
    }

    pub fn ticket(&self) -> &JobTicket {
        &self.ticket
    }

    /// Runs the task unless the job was cancelled while waiting.
    pub async fn run(self) {
        if self.ticket.start() {
            self.task.await;
        } else {
            tracing::trace!("Skipping cancelled job");
        }
    }
}

/// Where the loader sends network work.
pub trait Dispatch: Send + Sync {
    fn submit(&self, job: Job) -> Result<()>;

    /// Drops every job that has not started yet, returning how many.
    fn cancel_outstanding(&self) -> usize;

    /// Jobs waiting for a worker.
    fn queued(&self) -> usize;

    /// Live workers, busy or idle.
    fn workers(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: MAX_WORKERS,
            queue_capacity: 100,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.max_workers,
            queue_capacity: config.queue_capacity,
            idle_timeout: config.worker_idle_timeout,
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Notify,
    workers: AtomicUsize,
    idle: AtomicUsize,
    max_workers: usize,
    queue_capacity: usize,
    idle_timeout: Duration,
    runtime: Handle,
}

impl Shared {
    /// Starts another worker while queued jobs outnumber idle ones.
    fn grow_if_needed(self: &Arc<Self>, queued: usize) {
        if queued <= self.idle.load(Ordering::Acquire) || !self.try_grow() {
            return;
        }
        tracing::trace!(workers = self.workers.load(Ordering::Acquire), queued, "Starting worker");
        self.runtime.spawn(worker_loop(self.clone()));
    }

    /// Releases one worker slot unless it is the last one.
    fn try_retire(&self) -> bool {
        let mut current = self.workers.load(Ordering::Acquire);
        loop {
            if current <= 1 {
                return false;
            }
            match self.workers.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims a worker slot if the pool may still grow.
    fn try_grow(&self) -> bool {
        let mut current = self.workers.load(Ordering::Acquire);
        loop {
            if current >= self.max_workers {
                return false;
            }
            match self.workers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Bounded worker pool with a cancellable backlog.
///
/// Between one and `max_workers` tokio tasks pull jobs from a queue of at
/// most `queue_capacity`. Submitting to a full queue fails with
/// [`TileError::QueueFull`] instead of blocking. Idle workers above the first
/// retire after `idle_timeout`.
pub struct JobDispatcher {
    shared: Arc<Shared>,
}

impl JobDispatcher {
    /// Creates a dispatcher whose workers run on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_handle(config, Handle::current())
    }

    pub fn with_handle(config: DispatcherConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
                available: Notify::new(),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                max_workers: config.max_workers.clamp(1, MAX_WORKERS),
                queue_capacity: config.queue_capacity.max(1),
                idle_timeout: config.idle_timeout,
                runtime,
            }),
        }
    }

}

impl Dispatch for JobDispatcher {
    fn submit(&self, job: Job) -> Result<()> {
        let queued = {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.queue_capacity {
                tracing::warn!(capacity = self.shared.queue_capacity, "Job queue full, rejecting job");
                return Err(TileError::QueueFull);
            }
            queue.push_back(job);
            queue.len()
        };
        self.shared.available.notify_one();
        self.shared.grow_if_needed(queued);
        Ok(())
    }

    fn cancel_outstanding(&self) -> usize {
        let drained: Vec<Job> = self.shared.queue.lock().drain(..).collect();
        for job in &drained {
            job.ticket.cancel();
        }
        if !drained.is_empty() {
            tracing::debug!(cancelled = drained.len(), "Cancelled queued jobs");
        }
        drained.len()
    }

    fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        let (next, remaining) = {
            let mut queue = shared.queue.lock();
            let next = queue.pop_front();
            (next, queue.len())
        };
        match next {
            Some(job) => {
                shared.grow_if_needed(remaining);
                // A panicking job must not take the worker with it
                if let Err(e) = tokio::spawn(job.run()).await {
                    tracing::error!(error = %e, "Job panicked");
                }
            }
            None => {
                shared.idle.fetch_add(1, Ordering::AcqRel);
                let woken = tokio::time::timeout(shared.idle_timeout, shared.available.notified())
                    .await
                    .is_ok();
                shared.idle.fetch_sub(1, Ordering::AcqRel);

                if !woken && shared.queue.lock().is_empty() && shared.try_retire() {
                    tracing::trace!("Idle worker retiring");
                    return;
                }
            }
        }
    }
}
