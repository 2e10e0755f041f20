//! Shared engine state and worker thread lifecycle

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::collector::ResultCollector;
use crate::config::PoolConfig;
use crate::deadline::DeadlineTimer;
use crate::events::{EventSink, PoolEvent};
use crate::queue::TaskQueue;
use crate::supervisor::Supervisor;
use crate::task::{CancelReason, Outcome, TaskId};
use crate::worker::{Worker, WorkerState};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Tasks accepted by `submit` since the pool was created.
    pub tasks_submitted: u64,
    /// Tasks that finished with `Outcome::Success`.
    pub tasks_succeeded: u64,
    /// Tasks that finished with `Outcome::Failure`.
    pub tasks_failed: u64,
    /// Tasks that finished with `Outcome::Cancelled`.
    pub tasks_cancelled: u64,
    /// Worker threads replaced after dying mid-task.
    pub workers_replaced: u64,
    /// Tasks currently queued and not yet claimed.
    pub queue_depth: usize,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub(crate) tasks_submitted: AtomicU64,
    pub(crate) tasks_succeeded: AtomicU64,
    pub(crate) tasks_failed: AtomicU64,
    pub(crate) tasks_cancelled: AtomicU64,
    pub(crate) workers_replaced: AtomicU64,
}

/// State shared by the dispatcher, the workers, and the background
/// threads.
pub(crate) struct PoolShared<T> {
    pub(crate) config: PoolConfig,
    pub(crate) queue: TaskQueue<T>,
    pub(crate) collector: ResultCollector<T>,
    pub(crate) deadline: DeadlineTimer,
    pub(crate) events: Arc<dyn EventSink>,
    /// Stop signal for workers and the background threads.
    pub(crate) shutdown: AtomicBool,
    pub(crate) stats: StatCounters,
    sequence: AtomicU64,
}

impl<T> PoolShared<T> {
    pub(crate) fn new(config: PoolConfig, events: Arc<dyn EventSink>) -> Self {
        let queue = TaskQueue::new(config.queue_capacity);
        PoolShared {
            config,
            queue,
            collector: ResultCollector::new(),
            deadline: DeadlineTimer::new(),
            events,
            shutdown: AtomicBool::new(false),
            stats: StatCounters::default(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Next per-pool submission index.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Record a task's terminal outcome, then update counters and
    /// emit the matching event.
    ///
    /// `strict` is for writers that must hold the only terminal
    /// outcome (a worker completing an uncancelled task): losing that
    /// write means outcomes were double-recorded somewhere, so it is
    /// reported loudly instead of swallowed. Non-strict writers (the
    /// cancellation and shutdown paths) expect to lose races to real
    /// outcomes.
    ///
    /// Returns true if this call supplied the terminal outcome.
    pub(crate) fn record_terminal(&self, id: TaskId, outcome: Outcome<T>, strict: bool) -> bool {
        let event = match &outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(err) => Some(PoolEvent::TaskFailed {
                task_id: id,
                error: format!("{err:#}"),
            }),
            Outcome::Cancelled(reason) => Some(PoolEvent::TaskCancelled {
                task_id: id,
                reason: *reason,
            }),
        };
        let counter = match &outcome {
            Outcome::Success(_) => &self.stats.tasks_succeeded,
            Outcome::Failure(_) => &self.stats.tasks_failed,
            Outcome::Cancelled(_) => &self.stats.tasks_cancelled,
        };

        let recorded = if strict {
            match self.collector.record(id, outcome) {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(task_id = %id, %err, "terminal outcome dropped");
                    debug_assert!(false, "terminal outcome dropped for task {}: {}", id, err);
                    false
                }
            }
        } else {
            self.collector.try_record(id, outcome)
        };

        if recorded {
            counter.fetch_add(1, Ordering::Relaxed);
            if let Some(event) = event {
                self.events.emit(event);
            }
        }
        recorded
    }

    /// Resolve `id` as cancelled only if no worker has claimed it.
    /// The claim check and the write are atomic on the slot, so a task
    /// is either resolved here or left to its worker, never both.
    fn cancel_if_unclaimed(&self, id: TaskId, reason: CancelReason) -> bool {
        if !self
            .collector
            .try_record_unclaimed(id, Outcome::Cancelled(reason))
        {
            return false;
        }
        if let Some(slot) = self.collector.get(id) {
            slot.token().cancel_with(reason);
        }
        self.stats.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
        self.events.emit(PoolEvent::TaskCancelled {
            task_id: id,
            reason,
        });
        true
    }

    /// Drain-shutdown sweep: resolve every queued task as cancelled.
    /// Claimed tasks are left untouched, tokens included, so they run
    /// to completion under their workers.
    pub(crate) fn cancel_queued(&self, reason: CancelReason) {
        for (id, claimed) in self.collector.pending_tasks() {
            if !claimed {
                self.cancel_if_unclaimed(id, reason);
            }
        }
    }

    /// Forced-shutdown sweep: signal every pending task's token and
    /// resolve the unclaimed ones as cancelled. Claimed tasks keep
    /// running; their workers supply the outcome (or the shutdown path
    /// resolves them later).
    pub(crate) fn cancel_pending(&self, reason: CancelReason) {
        for (id, _) in self.collector.pending_tasks() {
            if let Some(slot) = self.collector.get(id) {
                slot.token().cancel_with(reason);
            }
            self.cancel_if_unclaimed(id, reason);
        }
    }

    /// Resolve every still-pending task, claimed or not. Last shutdown
    /// step, once no worker can deliver an outcome anymore.
    pub(crate) fn resolve_all_pending(&self, reason: CancelReason) {
        for (id, _) in self.collector.pending_tasks() {
            if let Some(slot) = self.collector.get(id) {
                slot.token().cancel_with(reason);
            }
            self.record_terminal(id, Outcome::Cancelled(reason), false);
        }
    }

    pub(crate) fn stats_snapshot(&self) -> PoolStats {
        PoolStats {
            tasks_submitted: self.stats.tasks_submitted.load(Ordering::Relaxed),
            tasks_succeeded: self.stats.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.stats.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.stats.tasks_cancelled.load(Ordering::Relaxed),
            workers_replaced: self.stats.workers_replaced.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }
}

/// The fixed set of worker threads plus their supervisor.
pub(crate) struct WorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    workers: Arc<Mutex<Vec<Worker>>>,
    supervisor: Supervisor,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub(crate) fn new(shared: Arc<PoolShared<T>>) -> Self {
        WorkerPool {
            shared,
            workers: Arc::new(Mutex::new(Vec::new())),
            supervisor: Supervisor::new(),
        }
    }

    /// Spawn the worker threads, the deadline timer, and the
    /// supervisor. The dispatcher's state machine ensures this runs at
    /// most once.
    pub(crate) fn start(&self) {
        {
            let mut workers = self.workers.lock();
            for id in 0..self.shared.config.worker_count {
                workers.push(Worker::spawn(id, self.shared.clone()));
            }
        }
        self.shared.deadline.start(self.shared.clone());
        self.supervisor.start(self.shared.clone(), self.workers.clone());
    }

    /// Stop the supervisor thread. Must happen before the workers are
    /// joined so it cannot resurrect them.
    pub(crate) fn stop_supervisor(&self) {
        self.supervisor.stop();
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.lock().iter().map(|w| w.state()).collect()
    }

    /// Wait for every worker to exit. Drain shutdown, no time bound.
    pub(crate) fn join_all(&self) {
        for mut worker in self.take_workers() {
            worker.join();
        }
    }

    /// Wait up to `grace` total for the workers to exit. Returns the
    /// abandoned workers as `(worker_id, busy_task)` pairs.
    pub(crate) fn join_grace(&self, grace: Duration) -> Vec<(usize, Option<TaskId>)> {
        let deadline = Instant::now() + grace;
        let mut abandoned = Vec::new();
        for mut worker in self.take_workers() {
            if worker.join_until(deadline) {
                continue;
            }
            abandoned.push((worker.id(), worker.busy_task()));
            worker.abandon();
        }
        abandoned
    }

    /// Take ownership of the worker handles so joining happens outside
    /// the lock.
    fn take_workers(&self) -> Vec<Worker> {
        std::mem::take(&mut *self.workers.lock())
    }
}
