//! Worker pool for endpoint handlers and response sends.
//!
//! A fixed set of OS threads shares one bounded queue. Handlers may block
//! (waiting on the UI context, sleeping for a click to settle), so they never
//! run on the accept thread or inside an async runtime.
//!
//! Overflow policy: a full queue rejects the job with [`PoolError::Saturated`];
//! the caller answers the request with an error instead of queueing without
//! bound.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::logging::LogThrottle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub queue_bound: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: 64,
        }
    }
}

/// Counters for monitoring and tests.
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    dispatched: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
    panicked: AtomicU64,
    queue_depth: AtomicUsize,
}

impl WorkerPoolMetrics {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Jobs refused because the queue was full or closed.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Queued jobs dropped during shutdown.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }
}

struct Shared {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    cancelled: AtomicBool,
    metrics: WorkerPoolMetrics,
    warnings: LogThrottle,
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.shared.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            self.warn_closed();
            return Err(PoolError::Closed);
        };

        let metrics = &self.shared.metrics;
        // Counted before the send so a fast worker never decrements first.
        metrics.queue_depth.fetch_add(1, Ordering::Relaxed);

        match sender.try_send(Box::new(job)) {
            Ok(()) => {
                metrics.dispatched.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                metrics.rejected.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.shared.warnings.admit("saturated") {
                    warn!(rejected = metrics.rejected(), suppressed, "Worker pool saturated");
                }
                Err(PoolError::Saturated)
            }
            Err(TrySendError::Closed(_)) => {
                metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                metrics.rejected.fetch_add(1, Ordering::Relaxed);
                self.warn_closed();
                Err(PoolError::Closed)
            }
        }
    }

    fn warn_closed(&self) {
        if let Some(suppressed) = self.shared.warnings.admit("closed") {
            warn!(suppressed, "Worker pool closed, rejecting job");
        }
    }

    pub fn metrics(&self) -> &WorkerPoolMetrics {
        &self.shared.metrics
    }
}

pub struct WorkerPool {
    handle: PoolHandle,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>(config.queue_bound.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared {
            sender: Mutex::new(Some(sender)),
            cancelled: AtomicBool::new(false),
            metrics: WorkerPoolMetrics::default(),
            warnings: LogThrottle::new(Duration::from_secs(1)),
        });

        info!(
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            "Creating worker pool"
        );

        let mut pool = Self {
            handle: PoolHandle { shared },
            workers: Vec::with_capacity(config.num_workers),
        };

        for worker_id in 0..config.num_workers.max(1) {
            let receiver = receiver.clone();
            let shared = pool.handle.shared.clone();

            // On failure `pool` drops here, which closes the queue for the
            // workers already running.
            let worker = std::thread::Builder::new()
                .name(format!("uiprobe-worker-{worker_id}"))
                .spawn(move || run_worker(worker_id, &receiver, &shared))?;
            pool.workers.push(worker);
        }

        Ok(pool)
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn metrics(&self) -> &WorkerPoolMetrics {
        self.handle.metrics()
    }

    /// Stop accepting jobs, drop everything still queued, and wait up to
    /// `grace` for in-flight jobs to finish. Workers still busy after the
    /// deadline are detached.
    pub fn shutdown(mut self, grace: Duration) {
        self.close();

        let deadline = Instant::now() + grace;
        while self.workers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut detached = 0;
        for worker in self.workers.drain(..) {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                detached += 1;
            }
        }

        if detached > 0 {
            warn!(detached, "Worker pool drain timed out, detaching busy workers");
        }
        debug!(
            completed = self.metrics().completed(),
            discarded = self.metrics().discarded(),
            "Worker pool shut down"
        );
    }

    fn close(&self) {
        let shared = &self.handle.shared;
        shared.cancelled.store(true, Ordering::SeqCst);
        shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(worker_id: usize, receiver: &Mutex<mpsc::Receiver<Job>>, shared: &Shared) {
    debug!(worker_id, "Worker started");

    loop {
        let job = {
            let mut receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.blocking_recv()
        };
        let Some(job) = job else {
            break;
        };
        shared.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);

        if shared.cancelled.load(Ordering::SeqCst) {
            shared.metrics.discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            shared.metrics.panicked.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, panic = ?panic, "Worker job panicked");
        }
        shared.metrics.completed.fetch_add(1, Ordering::Relaxed);
    }

    debug!(worker_id, "Worker exiting");
}
