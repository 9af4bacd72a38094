//! Callback executors.
//!
//! Decoded messages and state notifications are handed off the I/O threads
//! so a slow receiver cannot stall a connection. Every task carries an
//! affinity key (derived from the remote endpoint); tasks with the same key
//! run one at a time in submission order, which preserves per-connection
//! ordering while different connections proceed in parallel.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

/// Unit of work submitted to an executor
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Task-submission collaborator used for all connector callbacks.
pub trait CallbackExecutor: Send + Sync {
    /// Run `task` eventually.
    ///
    /// Tasks submitted with equal `affinity` must run sequentially in
    /// submission order.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor can no longer accept work.
    fn execute(&self, affinity: u64, task: Callback) -> Result<(), ExecutorError>;
}

/// Affinity key for anything hashable, typically an endpoint.
pub fn affinity_of<T: Hash + ?Sized>(key: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Executor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Executor is shutting down
    #[error("Callback executor is shutting down")]
    ShuttingDown,
}

/// Runs every task on the submitting thread.
///
/// Suitable for tests and receivers that never block; with a slow receiver
/// it stalls the I/O thread that delivered the message.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, _affinity: u64, task: Callback) -> Result<(), ExecutorError> {
        task();
        Ok(())
    }
}

/// Callback pool configuration
#[derive(Debug, Clone)]
pub struct CallbackPoolConfig {
    /// Number of worker threads (0 = auto-detect from CPU count)
    pub num_workers: usize,
    /// Queue capacity per worker
    pub queue_capacity: usize,
    /// Worker thread name prefix
    pub thread_name: String,
}

impl Default for CallbackPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 0, // Auto-detect
            queue_capacity: 4096,
            thread_name: "conduit-callback".to_string(),
        }
    }
}

/// Callback worker statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Tasks run to completion
    pub tasks_processed: AtomicU64,
    /// Tasks that panicked
    pub panics: AtomicU64,
    /// Submissions that found the queue full and had to wait
    pub backpressure_waits: AtomicU64,
}

/// Pool-wide statistics
#[derive(Debug)]
pub struct PoolStats {
    workers: Vec<Arc<WorkerStats>>,
    start_time: Instant,
}

impl PoolStats {
    /// Total tasks processed across all workers
    pub fn total_tasks(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.tasks_processed.load(Ordering::Relaxed))
            .sum()
    }

    /// Total panicking tasks across all workers
    pub fn total_panics(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.panics.load(Ordering::Relaxed))
            .sum()
    }

    /// Total backpressure waits across all workers
    pub fn total_backpressure_waits(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.backpressure_waits.load(Ordering::Relaxed))
            .sum()
    }

    /// Tasks per second since the pool started
    pub fn tasks_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_tasks() as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Fixed pool of callback threads with affinity routing.
///
/// Each worker owns a bounded queue; a task goes to worker
/// `affinity % num_workers`. A full queue applies backpressure to the
/// submitter instead of dropping the task. On a multi-thread tokio worker
/// the wait goes through `block_in_place`, so only the submitting task
/// pauses and the runtime keeps driving other connections. Dropping the
/// pool lets queued tasks finish and joins the workers.
pub struct CallbackPool {
    senders: Vec<Sender<Callback>>,
    workers: Vec<Worker>,
    stats: PoolStats,
}

impl CallbackPool {
    /// Create a pool.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(config: CallbackPoolConfig) -> std::io::Result<Self> {
        let num_workers = if config.num_workers == 0 {
            num_cpus::get()
        } else {
            config.num_workers
        };

        debug!(
            "Creating callback pool with {} workers (queue capacity: {})",
            num_workers, config.queue_capacity
        );

        let mut senders = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        let mut worker_stats = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let (tx, rx) = bounded(config.queue_capacity.max(1));
            let stats = Arc::new(WorkerStats::default());
            worker_stats.push(stats.clone());
            workers.push(Worker::spawn(id, &config.thread_name, rx, stats)?);
            senders.push(tx);
        }

        Ok(Self {
            senders,
            workers,
            stats: PoolStats {
                workers: worker_stats,
                start_time: Instant::now(),
            },
        })
    }

    /// Pool with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn with_defaults() -> std::io::Result<Self> {
        Self::new(CallbackPoolConfig::default())
    }

    /// Number of workers in the pool
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl CallbackExecutor for CallbackPool {
    fn execute(&self, affinity: u64, task: Callback) -> Result<(), ExecutorError> {
        if self.senders.is_empty() {
            return Err(ExecutorError::ShuttingDown);
        }
        let index = (affinity % self.senders.len() as u64) as usize;
        let sender = &self.senders[index];

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                self.stats.workers[index]
                    .backpressure_waits
                    .fetch_add(1, Ordering::Relaxed);
                off_runtime(|| sender.send(task)).map_err(|_| ExecutorError::ShuttingDown)
            }
            Err(TrySendError::Disconnected(_)) => Err(ExecutorError::ShuttingDown),
        }
    }
}

/// Run a blocking wait without parking a runtime worker thread.
fn off_runtime<R>(wait: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        // Closing the queues ends each worker loop once it is drained
        self.senders.clear();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread_id == current {
                // Last reference dropped from inside a callback; cannot join self
                continue;
            }
            if let Err(e) = worker.handle.join() {
                error!("Callback worker {} failed to join: {:?}", worker.id, e);
            }
        }

        info!(
            "Callback pool shut down ({} tasks, {} panics)",
            self.stats.total_tasks(),
            self.stats.total_panics()
        );
    }
}

/// Individual callback thread
struct Worker {
    id: usize,
    thread_id: ThreadId,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(
        id: usize,
        name: &str,
        rx: Receiver<Callback>,
        stats: Arc<WorkerStats>,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || {
                debug!("Callback worker {} starting", id);

                for task in rx.iter() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        stats.panics.fetch_add(1, Ordering::Relaxed);
                        warn!("Callback panicked on worker {}", id);
                    }
                    stats.tasks_processed.fetch_add(1, Ordering::Relaxed);
                }

                debug!(
                    "Callback worker {} shutting down (processed {} tasks)",
                    id,
                    stats.tasks_processed.load(Ordering::Relaxed)
                );
            })?;

        Ok(Self {
            id,
            thread_id: handle.thread().id(),
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    fn small_pool(workers: usize, capacity: usize) -> CallbackPool {
        CallbackPool::new(CallbackPoolConfig {
            num_workers: workers,
            queue_capacity: capacity,
            thread_name: "test-callback".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_pool_config_default() {
        let config = CallbackPoolConfig::default();
        assert_eq!(config.num_workers, 0);
        assert_eq!(config.queue_capacity, 4096);
    }

    #[test]
    fn test_inline_executor_runs_immediately() {
        let (tx, rx) = mpsc::channel();
        InlineExecutor
            .execute(0, Box::new(move || tx.send(7).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv(), Ok(7));
    }

    #[test]
    fn test_pool_auto_detect_workers() {
        let pool = CallbackPool::with_defaults().unwrap();
        assert_eq!(pool.num_workers(), num_cpus::get());
    }

    #[test]
    fn test_same_affinity_runs_in_order() {
        let pool = small_pool(4, 8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..500u32 {
            let seen = Arc::clone(&seen);
            pool.execute(42, Box::new(move || seen.lock().push(i)))
                .unwrap();
        }
        drop(pool);

        assert_eq!(*seen.lock(), (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_queued_tasks() {
        let pool = small_pool(2, 64);
        let counter = Arc::new(AtomicU64::new(0));
        for i in 0..100u64 {
            let counter = Arc::clone(&counter);
            pool.execute(i, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = small_pool(1, 8);
        pool.execute(0, Box::new(|| panic!("receiver bug"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(0, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(pool.stats().total_panics(), 1);
    }

    #[test]
    fn test_full_queue_applies_backpressure() {
        let pool = small_pool(1, 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        // Block the only worker until released
        pool.execute(0, Box::new(move || {
            let _ = gate_rx.recv();
        }))
        .unwrap();
        pool.execute(0, Box::new(|| {})).unwrap();

        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate_tx.send(()).unwrap();
        });
        // Queue is full; this blocks until the worker frees a slot
        pool.execute(0, Box::new(|| {})).unwrap();
        release.join().unwrap();

        assert!(pool.stats().total_backpressure_waits() >= 1);
    }

    #[test]
    fn test_full_queue_keeps_runtime_running() {
        let pool = Arc::new(small_pool(1, 1));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.execute(0, Box::new(move || {
            let _ = gate_rx.recv();
        }))
        .unwrap();
        pool.execute(0, Box::new(|| {})).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        // Stuck on the full queue until the gate opens
        let stuck = {
            let pool = Arc::clone(&pool);
            runtime.spawn(async move { pool.execute(0, Box::new(|| {})) })
        };
        thread::sleep(Duration::from_millis(100));

        let (tx, rx) = mpsc::channel();
        runtime.spawn(async move { tx.send(()).unwrap() });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        gate_tx.send(()).unwrap();
        assert!(runtime.block_on(stuck).unwrap().is_ok());
        assert!(pool.stats().total_backpressure_waits() >= 1);
    }

    #[test]
    fn test_affinity_of_is_stable() {
        let a = affinity_of("127.0.0.1:5684");
        let b = affinity_of("127.0.0.1:5684");
        assert_eq!(a, b);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Tasks sharing a key run in submission order whatever the mix
            #[test]
            fn per_key_order(
                workers in 1usize..5,
                keys in prop::collection::vec(0u64..6, 1..200),
            ) {
                let pool = small_pool(workers, 4);
                let seen = Arc::new(Mutex::new(Vec::new()));
                for (seq, key) in keys.iter().copied().enumerate() {
                    let seen = Arc::clone(&seen);
                    pool.execute(key, Box::new(move || seen.lock().push((key, seq))))
                        .unwrap();
                }
                drop(pool);

                let seen = seen.lock();
                prop_assert_eq!(seen.len(), keys.len());
                for key in 0u64..6 {
                    let order: Vec<usize> =
                        seen.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
                    let mut sorted = order.clone();
                    sorted.sort_unstable();
                    prop_assert_eq!(order, sorted);
                }
            }
        }
    }
}
