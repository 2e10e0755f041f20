//! Dispatcher: the public entry point of the engine

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventSink, PoolEvent, TracingSink};
use crate::pool::{PoolShared, PoolStats, WorkerPool};
use crate::queue::WorkItem;
use crate::task::{CancelReason, CancelToken, Outcome, Payload, TaskId, TaskReport, TaskSlot};
use crate::worker::WorkerState;

/// Lifecycle state of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Built but not started; submissions are refused.
    Created,
    /// Accepting and executing tasks.
    Running,
    /// Shutting down while queued tasks finish.
    Draining,
    /// Fully stopped. Terminal.
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::Created => "Created",
            DispatcherState::Running => "Running",
            DispatcherState::Draining => "Draining",
            DispatcherState::Stopped => "Stopped",
        };
        write!(f, "{}", name)
    }
}

/// Caller-side handle to one submitted task.
///
/// The handle owns the right to retrieve the task's outcome: retrieval
/// is one-shot, and after a successful `wait` or `poll` the engine
/// forgets the task. Dropping the handle without retrieving leaves the
/// outcome held until the retention sweep (if configured) discards it.
pub struct TaskHandle<T> {
    id: TaskId,
    shared: Arc<PoolShared<T>>,
}

impl<T> TaskHandle<T> {
    /// The task's ID.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the task has a terminal outcome and take it.
    pub fn wait(&self) -> PoolResult<TaskReport<T>> {
        self.shared.collector.wait_for(self.id, None)
    }

    /// Like [`wait`](TaskHandle::wait) but gives up with
    /// [`PoolError::WaitTimeout`] after `timeout`. The task keeps
    /// running and the outcome stays retrievable.
    pub fn wait_timeout(&self, timeout: Duration) -> PoolResult<TaskReport<T>> {
        self.shared.collector.wait_for(self.id, Some(timeout))
    }

    /// Non-blocking retrieval: `Ok(None)` while the task is in
    /// flight, `Ok(Some(report))` exactly once when it is terminal.
    pub fn poll(&self) -> PoolResult<Option<TaskReport<T>>> {
        self.shared.collector.poll(self.id)
    }

    /// Request cancellation.
    ///
    /// A task no worker has claimed yet resolves immediately to
    /// `Cancelled(Requested)` and its payload never runs. A claimed
    /// task only has its token set; the payload decides when to stop,
    /// and a payload that runs to completion anyway keeps its real
    /// outcome.
    pub fn cancel(&self) {
        let slot = match self.shared.collector.get(self.id) {
            Some(slot) => slot,
            None => return,
        };
        slot.token().cancel_with(CancelReason::Requested);
        if !slot.is_claimed() {
            self.shared.record_terminal(
                self.id,
                Outcome::Cancelled(CancelReason::Requested),
                false,
            );
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// Task-execution engine: a bounded queue feeding a fixed pool of
/// worker threads, with per-task outcome retrieval.
///
/// The dispatcher moves through `Created -> Running -> Stopped`, with
/// `Draining` between `Running` and `Stopped` while a draining
/// shutdown waits for claimed tasks to finish. Submissions are
/// accepted only while `Running`; a bounded queue pushes back by
/// blocking `submit` rather than rejecting work.
pub struct Dispatcher<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    pool: WorkerPool<T>,
    state: Mutex<DispatcherState>,
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Build a dispatcher with the default `tracing` event sink.
    /// Validates the config; no threads start until
    /// [`start`](Dispatcher::start).
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        Self::with_event_sink(config, Arc::new(TracingSink))
    }

    /// Build a dispatcher that reports lifecycle events to `sink`.
    pub fn with_event_sink(config: PoolConfig, sink: Arc<dyn EventSink>) -> PoolResult<Self> {
        config.validate()?;
        let shared = Arc::new(PoolShared::new(config, sink));
        let pool = WorkerPool::new(shared.clone());
        Ok(Dispatcher {
            shared,
            pool,
            state: Mutex::new(DispatcherState::Created),
        })
    }

    /// Spawn the worker pool and move to `Running`. Fails with
    /// [`PoolError::AlreadyStarted`] on any call after the first.
    pub fn start(&self) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            if *state != DispatcherState::Created {
                return Err(PoolError::AlreadyStarted);
            }
            *state = DispatcherState::Running;
        }
        self.pool.start();
        tracing::info!(
            workers = self.shared.config.worker_count,
            queue_capacity = self.shared.config.queue_capacity,
            "dispatcher started"
        );
        Ok(())
    }

    /// Submit a payload for execution, applying the configured default
    /// task timeout.
    ///
    /// Blocks while a bounded queue is full. Fails with
    /// [`PoolError::DispatcherNotRunning`] outside `Running` and with
    /// [`PoolError::QueueClosed`] if shutdown closes the queue while
    /// this call is blocked on space.
    pub fn submit<F>(&self, payload: F) -> PoolResult<TaskHandle<T>>
    where
        F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_inner(Box::new(payload), self.shared.config.default_task_timeout)
    }

    /// Submit with an explicit execution window instead of the
    /// configured default. `None` runs the task without a deadline.
    pub fn submit_with_timeout<F>(
        &self,
        payload: F,
        timeout: Option<Duration>,
    ) -> PoolResult<TaskHandle<T>>
    where
        F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_inner(Box::new(payload), timeout)
    }

    /// Submit a batch in order. Stops at the first refused submission;
    /// handles already returned stay valid.
    pub fn submit_batch<F>(
        &self,
        payloads: impl IntoIterator<Item = F>,
    ) -> PoolResult<Vec<TaskHandle<T>>>
    where
        F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        let mut handles = Vec::new();
        for payload in payloads {
            handles.push(self.submit(payload)?);
        }
        Ok(handles)
    }

    fn submit_inner(
        &self,
        payload: Payload<T>,
        deadline: Option<Duration>,
    ) -> PoolResult<TaskHandle<T>> {
        {
            let state = self.state.lock();
            if *state != DispatcherState::Running {
                return Err(PoolError::DispatcherNotRunning(*state));
            }
        }
        // The state lock is released before the potentially blocking
        // enqueue so a full queue cannot wedge shutdown. A submission
        // that slips past the check while shutdown begins is resolved
        // by the shutdown sweeps: the slot is registered before the
        // enqueue, and enqueue itself fails once the queue closes.
        let id = TaskId::new();
        let slot = Arc::new(TaskSlot::new(id, self.shared.next_sequence()));
        self.shared.collector.register(slot.clone());
        let item = WorkItem {
            id,
            payload,
            deadline,
            slot,
        };
        if let Err(err) = self.shared.queue.enqueue(item) {
            // The slot was visible to the shutdown sweeps while this
            // call was blocked. If a sweep already resolved it, a
            // cancellation was counted for a task the caller never got
            // a handle to; undo it.
            if let Some(slot) = self.shared.collector.unregister(id) {
                if !slot.is_pending() {
                    self.shared.stats.tasks_cancelled.fetch_sub(1, Ordering::Relaxed);
                }
            }
            return Err(err);
        }
        self.shared.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(TaskHandle {
            id,
            shared: self.shared.clone(),
        })
    }

    /// Request cancellation of the task behind `handle`. Equivalent to
    /// [`TaskHandle::cancel`].
    pub fn cancel(&self, handle: &TaskHandle<T>) {
        handle.cancel();
    }

    /// Wait until no task is pending (queued or running), up to
    /// `timeout`. Returns true if the pool went quiet in time.
    pub fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.collector.pending_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Shut the pool down. Idempotent; a call during an in-progress
    /// shutdown returns immediately.
    ///
    /// With `drain` set, tasks already claimed by a worker run to
    /// completion and the call blocks without bound until they do;
    /// tasks still queued resolve to `Cancelled(Shutdown)` unrun.
    /// Without it, queued tasks resolve the same way, running tasks
    /// additionally get their tokens signalled, and workers still busy
    /// after the configured grace period are abandoned with their task
    /// resolved to `Cancelled(ForcedShutdown)`.
    pub fn shutdown(&self, drain: bool) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                DispatcherState::Stopped | DispatcherState::Draining => return Ok(()),
                DispatcherState::Created => {
                    *state = DispatcherState::Stopped;
                    return Ok(());
                }
                DispatcherState::Running => {
                    *state = if drain {
                        DispatcherState::Draining
                    } else {
                        DispatcherState::Stopped
                    };
                }
            }
        }
        tracing::info!(drain, "dispatcher shutting down");
        self.shared.queue.close();

        if drain {
            // Queued tasks are resolved before the workers can claim
            // more; claimed tasks finish under their workers, whose
            // pops of the swept items fall through. The supervisor must
            // stop before the join so it cannot resurrect workers.
            self.shared.cancel_queued(CancelReason::Shutdown);
            self.pool.stop_supervisor();
            self.pool.join_all();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.deadline.stop();
            // Covers submissions that raced the close and never got
            // claimed.
            self.shared.resolve_all_pending(CancelReason::Shutdown);
            *self.state.lock() = DispatcherState::Stopped;
        } else {
            self.shared.cancel_pending(CancelReason::Shutdown);
            self.shared.shutdown.store(true, Ordering::Release);
            self.pool.stop_supervisor();
            self.shared.deadline.stop();
            let abandoned = self.pool.join_grace(self.shared.config.shutdown_grace);
            for (worker_id, task_id) in abandoned {
                tracing::warn!(
                    worker_id,
                    ?task_id,
                    "worker still busy after grace period, abandoning"
                );
                if let Some(task_id) = task_id {
                    self.shared.record_terminal(
                        task_id,
                        Outcome::Cancelled(CancelReason::ForcedShutdown),
                        false,
                    );
                }
            }
            self.shared.resolve_all_pending(CancelReason::Shutdown);
        }

        self.shared.events.emit(PoolEvent::PoolShutdown { drain });
        tracing::info!(drain, "dispatcher stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats_snapshot()
    }

    /// What each worker is doing right now.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.pool.worker_states()
    }

    /// Tasks queued and not yet claimed.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// The configuration this dispatcher was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl<T: Send + 'static> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &*self.state.lock())
            .field("workers", &self.shared.config.worker_count)
            .field("queue_len", &self.shared.queue.len())
            .finish()
    }
}

impl<T: Send + 'static> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        let state = *self.state.lock();
        if matches!(state, DispatcherState::Running | DispatcherState::Draining) {
            let _ = self.shutdown(false);
        }
    }
}
