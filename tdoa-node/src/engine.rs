//! engine.rs — parallel processing engine
//!
//! Worker pool fed by a dynamic max-priority queue. Each task carries a
//! processing closure over a shared signal; workers pick the highest-priority
//! task (ties broken by earliest submission), run it, and fulfil a one-shot
//! result handle. Queue overflow is resolved by a configurable backpressure
//! policy; evicted tasks resolve to `None` and are counted.
//!
//! Selection is a linear scan by design: the queue stays small relative to
//! worker throughput, and a heap's amortized reordering would not preserve the
//! earliest-timestamp tie-break.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, warn};
use uuid::Uuid;

use tdoa_types::TaskPriority;

use crate::signal::Signal;

// ── Configuration ─────────────────────────────────────────────────────────────

/// What to do when the queue is at `max_queue_size` and a new task arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Block the submitter until a worker frees a slot (or shutdown)
    Block,
    /// Evict the task with the earliest creation timestamp
    DropOldest,
    /// Evict the task that is minimal under the queue ordering
    DropLowestPriority,
    /// Reject the incoming task
    DropNew,
    /// Let the queue grow past the limit
    ExpandQueue,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker count; 0 = hardware concurrency (fallback 4)
    pub workers: usize,
    pub max_queue_size: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 0, max_queue_size: 1000, backpressure: BackpressurePolicy::Block }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

pub type ProcessFn = Box<dyn FnOnce(Arc<Signal>) -> Option<Arc<Signal>> + Send + 'static>;

/// One-shot, single-consumer handle to a task's result. Evicted, cancelled,
/// failed, and shutdown-drained tasks all resolve to `None`.
pub struct TaskHandle {
    rx: Receiver<Option<Arc<Signal>>>,
    task_id: String,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Block until the task resolves. A disconnected channel (engine dropped
    /// mid-flight) also reads as `None`.
    pub fn wait(self) -> Option<Arc<Signal>> {
        self.rx.recv().unwrap_or(None)
    }

    pub fn wait_timeout(&self, timeout: std::time::Duration) -> std::result::Result<Option<Arc<Signal>>, std::sync::mpsc::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

struct QueuedTask {
    signal: Arc<Signal>,
    process: ProcessFn,
    priority: TaskPriority,
    created: Instant,
    /// Monotonic submission index; breaks `Instant` ties deterministically
    seq: u64,
    task_id: String,
    signal_id: String,
    result_tx: SyncSender<Option<Arc<Signal>>>,
}

impl QueuedTask {
    /// True when `self` should run before `other`: higher priority first,
    /// then earlier submission.
    fn beats(&self, other: &QueuedTask) -> bool {
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        (self.created, self.seq) < (other.created, other.seq)
    }

    fn resolve(self, result: Option<Arc<Signal>>) {
        // Receiver may already be gone; that is the consumer's choice.
        let _ = self.result_tx.send(result);
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub total_processed: u64,
    pub total_dropped: u64,
    pub current_queue_size: usize,
    pub peak_queue_size: usize,
    pub active_workers: usize,
    pub average_processing_ms: f64,
    pub max_processing_ms: f64,
    pub priority_counts: HashMap<TaskPriority, u64>,
}

#[derive(Default)]
struct StatsInner {
    total_processed: u64,
    peak_queue_size: usize,
    total_processing_ms: f64,
    max_processing_ms: f64,
    priority_counts: HashMap<TaskPriority, u64>,
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct Shared {
    queue: Mutex<Vec<QueuedTask>>,
    /// Wakes workers on enqueue or shutdown
    work_available: Condvar,
    /// Wakes blocked submitters when a slot frees up
    queue_space: Condvar,
    running: AtomicBool,
    total_dropped: AtomicU64,
    active_workers: AtomicU64,
    stats: Mutex<StatsInner>,
    config: EngineConfig,
}

/// Parallel signal-processing engine. Construct one per pipeline context and
/// thread it into the components that submit work.
pub struct ProcessingEngine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_seq: AtomicU64,
}

impl ProcessingEngine {
    pub fn new(config: EngineConfig) -> Self {
        let worker_count = if config.workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            config.workers
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::with_capacity(config.max_queue_size)),
            work_available: Condvar::new(),
            queue_space: Condvar::new(),
            running: AtomicBool::new(true),
            total_dropped: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            stats: Mutex::new(StatsInner::default()),
            config,
        });

        let workers = (0..worker_count)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("dsp-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers, next_seq: AtomicU64::new(0) }
    }

    /// Submit a processing task. Under the `Block` policy this call may block
    /// until a slot frees or shutdown begins.
    pub fn submit(
        &self,
        signal: Arc<Signal>,
        process: ProcessFn,
        priority: TaskPriority,
    ) -> TaskHandle {
        let (tx, rx) = sync_channel(1);
        let task_id = format!("task-{}", Uuid::new_v4().simple());
        let handle = TaskHandle { rx, task_id: task_id.clone() };

        let task = QueuedTask {
            signal_id: signal.id().to_string(),
            signal,
            process,
            priority,
            created: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            task_id,
            result_tx: tx,
        };

        if !self.shared.running.load(Ordering::SeqCst) {
            warn!("engine is shut down, rejecting task {}", task.task_id);
            task.resolve(None);
            return handle;
        }

        let mut queue = self.shared.queue.lock().unwrap();
        if self.shared.config.backpressure == BackpressurePolicy::Block {
            while queue.len() >= self.shared.config.max_queue_size
                && self.shared.running.load(Ordering::SeqCst)
            {
                queue = self.shared.queue_space.wait(queue).unwrap();
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                drop(queue);
                task.resolve(None);
                return handle;
            }
        } else if queue.len() >= self.shared.config.max_queue_size {
            let admitted = apply_drop_policy(&self.shared, &mut queue);
            if !admitted {
                drop(queue);
                self.shared.total_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("queue full, dropping incoming task {}", task.task_id);
                task.resolve(None);
                return handle;
            }
        }

        queue.push(task);
        let depth = queue.len();
        drop(queue);

        let mut stats = self.shared.stats.lock().unwrap();
        if depth > stats.peak_queue_size {
            stats.peak_queue_size = depth;
        }
        drop(stats);

        self.shared.work_available.notify_one();
        handle
    }

    /// Remove a still-queued task; in-flight tasks are not cancelled.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();
        if let Some(i) = queue.iter().position(|t| t.task_id == task_id) {
            let task = queue.swap_remove(i);
            drop(queue);
            self.shared.total_dropped.fetch_add(1, Ordering::Relaxed);
            self.shared.queue_space.notify_one();
            task.resolve(None);
            return true;
        }
        false
    }

    pub fn stats(&self) -> EngineStats {
        let queue_len = self.shared.queue.lock().unwrap().len();
        let inner = self.shared.stats.lock().unwrap();
        EngineStats {
            total_processed: inner.total_processed,
            total_dropped: self.shared.total_dropped.load(Ordering::Relaxed),
            current_queue_size: queue_len,
            peak_queue_size: inner.peak_queue_size,
            active_workers: self.shared.active_workers.load(Ordering::Relaxed) as usize,
            average_processing_ms: if inner.total_processed > 0 {
                inner.total_processing_ms / inner.total_processed as f64
            } else {
                0.0
            },
            max_processing_ms: inner.max_processing_ms,
            priority_counts: inner.priority_counts.clone(),
        }
    }

    pub fn reset_stats(&self) {
        *self.shared.stats.lock().unwrap() = StatsInner::default();
        self.shared.total_dropped.store(0, Ordering::Relaxed);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop workers and resolve every still-queued handle with `None`.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.work_available.notify_all();
        self.shared.queue_space.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let drained: Vec<QueuedTask> = self.shared.queue.lock().unwrap().drain(..).collect();
        for task in drained {
            task.resolve(None);
        }
    }
}

impl Drop for ProcessingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Evict one task per the non-blocking drop policies. Returns true when the
/// caller may push its task. Caller holds the queue lock.
fn apply_drop_policy(shared: &Shared, queue: &mut Vec<QueuedTask>) -> bool {
    match shared.config.backpressure {
        BackpressurePolicy::ExpandQueue => true,
        BackpressurePolicy::DropNew => false,
        BackpressurePolicy::DropOldest => {
            let idx = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| (t.created, t.seq))
                .map(|(i, _)| i);
            match idx {
                Some(i) => {
                    let evicted = queue.swap_remove(i);
                    shared.total_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("drop-oldest evicted task {}", evicted.task_id);
                    evicted.resolve(None);
                    true
                }
                None => false,
            }
        }
        BackpressurePolicy::DropLowestPriority => {
            let mut lowest: Option<usize> = None;
            for i in 0..queue.len() {
                match lowest {
                    None => lowest = Some(i),
                    Some(l) if queue[l].beats(&queue[i]) => lowest = Some(i),
                    _ => {}
                }
            }
            match lowest {
                Some(i) => {
                    let evicted = queue.swap_remove(i);
                    shared.total_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("drop-lowest-priority evicted task {}", evicted.task_id);
                    evicted.resolve(None);
                    true
                }
                None => false,
            }
        }
        BackpressurePolicy::Block => true,
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                // Linear max-scan: highest priority, then earliest submission.
                let best = {
                    let mut best: Option<usize> = None;
                    for i in 0..queue.len() {
                        match best {
                            None => best = Some(i),
                            Some(b) if queue[i].beats(&queue[b]) => best = Some(i),
                            _ => {}
                        }
                    }
                    best
                };
                if let Some(i) = best {
                    let task = queue.swap_remove(i);
                    shared.queue_space.notify_one();
                    break task;
                }
                queue = shared.work_available.wait(queue).unwrap();
            }
        };

        shared.active_workers.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let signal = task.signal.clone();
        let process = task.process;
        let result = match catch_unwind(AssertUnwindSafe(move || process(signal))) {
            Ok(r) => r,
            Err(_) => {
                error!(
                    "processing task {} (signal {}) panicked, resolving null",
                    task.task_id, task.signal_id
                );
                None
            }
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        {
            let mut stats = shared.stats.lock().unwrap();
            stats.total_processed += 1;
            stats.total_processing_ms += elapsed_ms;
            if elapsed_ms > stats.max_processing_ms {
                stats.max_processing_ms = elapsed_ms;
            }
            *stats.priority_counts.entry(task.priority).or_insert(0) += 1;
        }
        shared.active_workers.fetch_sub(1, Ordering::Relaxed);
        let _ = task.result_tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SampleFormat;
    use std::time::Duration;

    fn dummy_signal() -> Arc<Signal> {
        Arc::new(Signal::new(SampleFormat::ComplexFloat32, 16))
    }

    fn passthrough() -> ProcessFn {
        Box::new(|s| Some(s))
    }

    fn engine(policy: BackpressurePolicy, workers: usize, cap: usize) -> ProcessingEngine {
        ProcessingEngine::new(EngineConfig {
            workers,
            max_queue_size: cap,
            backpressure: policy,
        })
    }

    #[test]
    fn task_resolves_exactly_once_with_result() {
        let eng = engine(BackpressurePolicy::Block, 2, 16);
        let handle = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        let out = handle.wait();
        assert!(out.is_some());
        assert_eq!(eng.stats().total_processed, 1);
    }

    #[test]
    fn panicking_task_resolves_null_and_does_not_kill_worker() {
        let eng = engine(BackpressurePolicy::Block, 1, 16);
        let h1 = eng.submit(dummy_signal(), Box::new(|_| panic!("boom")), TaskPriority::Normal);
        assert!(h1.wait().is_none());
        // Worker must still be alive for the next task
        let h2 = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        assert!(h2.wait().is_some());
    }

    #[test]
    fn priority_order_with_timestamp_tiebreak() {
        let eng = engine(BackpressurePolicy::ExpandQueue, 1, 16);
        // Saturate the single worker so later submissions stay queued.
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate2 = gate.clone();
        let _blocker = eng.submit(
            dummy_signal(),
            Box::new(move |s| {
                let _g = gate2.lock().unwrap();
                Some(s)
            }),
            TaskPriority::Critical,
        );
        std::thread::sleep(Duration::from_millis(50));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mk = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> ProcessFn {
            Box::new(move |s| {
                order.lock().unwrap().push(label);
                Some(s)
            })
        };
        let h_low = eng.submit(dummy_signal(), mk("low", order.clone()), TaskPriority::Low);
        let h_n1 = eng.submit(dummy_signal(), mk("normal-1", order.clone()), TaskPriority::Normal);
        let h_n2 = eng.submit(dummy_signal(), mk("normal-2", order.clone()), TaskPriority::Normal);
        let h_high = eng.submit(dummy_signal(), mk("high", order.clone()), TaskPriority::High);
        drop(held);

        for h in [h_low, h_n1, h_n2, h_high] {
            let _ = h.wait();
        }
        let order = order.lock().unwrap();
        assert_eq!(&*order, &["high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn drop_oldest_evicts_earliest_task() {
        // Queue cap 4, no worker drain: stall the one worker first.
        let eng = engine(BackpressurePolicy::DropOldest, 1, 4);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate2 = gate.clone();
        let _blocker = eng.submit(
            dummy_signal(),
            Box::new(move |s| {
                let _g = gate2.lock().unwrap();
                Some(s)
            }),
            TaskPriority::Critical,
        );
        std::thread::sleep(Duration::from_millis(50));

        let handles: Vec<TaskHandle> = (0..4)
            .map(|_| eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal))
            .collect();
        assert_eq!(eng.stats().current_queue_size, 4);

        // Fifth enqueue evicts t1 (the earliest)
        let h5 = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        let mut handles = handles.into_iter();
        let t1 = handles.next().unwrap();
        assert!(t1.wait().is_none(), "oldest task must resolve null");
        assert_eq!(eng.stats().total_dropped, 1);
        assert_eq!(eng.stats().current_queue_size, 4);

        drop(held);
        for h in handles {
            assert!(h.wait().is_some());
        }
        assert!(h5.wait().is_some());
    }

    #[test]
    fn drop_lowest_priority_evicts_queue_minimum() {
        let eng = engine(BackpressurePolicy::DropLowestPriority, 1, 3);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate2 = gate.clone();
        let _blocker = eng.submit(
            dummy_signal(),
            Box::new(move |s| {
                let _g = gate2.lock().unwrap();
                Some(s)
            }),
            TaskPriority::Critical,
        );
        std::thread::sleep(Duration::from_millis(50));

        let h_low = eng.submit(dummy_signal(), passthrough(), TaskPriority::Low);
        let _h_n = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        let _h_h = eng.submit(dummy_signal(), passthrough(), TaskPriority::High);
        let _h_new = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);

        assert!(h_low.wait().is_none(), "low-priority task must be evicted");
        assert_eq!(eng.stats().total_dropped, 1);
        drop(held);
    }

    #[test]
    fn drop_new_rejects_incoming() {
        let eng = engine(BackpressurePolicy::DropNew, 1, 2);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate2 = gate.clone();
        let _blocker = eng.submit(
            dummy_signal(),
            Box::new(move |s| {
                let _g = gate2.lock().unwrap();
                Some(s)
            }),
            TaskPriority::Critical,
        );
        std::thread::sleep(Duration::from_millis(50));

        let _a = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        let _b = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        let rejected = eng.submit(dummy_signal(), passthrough(), TaskPriority::Critical);
        assert!(rejected.wait().is_none());
        assert_eq!(eng.stats().total_dropped, 1);
        drop(held);
    }

    #[test]
    fn cancel_removes_queued_task_only() {
        let eng = engine(BackpressurePolicy::ExpandQueue, 1, 8);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate2 = gate.clone();
        let _blocker = eng.submit(
            dummy_signal(),
            Box::new(move |s| {
                let _g = gate2.lock().unwrap();
                Some(s)
            }),
            TaskPriority::Critical,
        );
        std::thread::sleep(Duration::from_millis(50));

        let h = eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal);
        let id = h.task_id().to_string();
        assert!(eng.cancel(&id));
        assert!(h.wait().is_none());
        assert!(!eng.cancel(&id), "cancel of unknown id fails");
        drop(held);
    }

    #[test]
    fn shutdown_resolves_all_queued_handles_with_null() {
        let mut eng = engine(BackpressurePolicy::ExpandQueue, 1, 8);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate2 = gate.clone();
        let blocker = eng.submit(
            dummy_signal(),
            Box::new(move |s| {
                let _g = gate2.lock().unwrap();
                Some(s)
            }),
            TaskPriority::Critical,
        );
        std::thread::sleep(Duration::from_millis(50));

        let queued: Vec<TaskHandle> = (0..3)
            .map(|_| eng.submit(dummy_signal(), passthrough(), TaskPriority::Normal))
            .collect();
        drop(held);
        let _ = blocker.wait();
        eng.shutdown();
        for h in queued {
            // Fulfilled exactly once: either the worker got to it before
            // shutdown (Some) or the drain resolved it (None); recv never hangs.
            let _ = h.wait_timeout(Duration::from_secs(1)).expect("handle must be fulfilled");
        }
    }
}
