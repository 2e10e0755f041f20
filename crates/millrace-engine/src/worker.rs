//! Worker threads: claim tasks, run payloads, record outcomes

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::pool::PoolShared;
use crate::queue::{Dequeue, WorkItem, TICK};
use crate::task::{CancelReason, Outcome, TaskId};

/// What a worker thread is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for work.
    Idle,
    /// Executing the given task.
    Busy(TaskId),
    /// The worker observed shutdown and will not claim again.
    ShuttingDown,
}

/// Handle to one worker thread.
pub(crate) struct Worker {
    id: usize,
    state: Arc<Mutex<WorkerState>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<T: Send + 'static>(id: usize, shared: Arc<PoolShared<T>>) -> Self {
        let state = Arc::new(Mutex::new(WorkerState::Idle));
        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", shared.config.thread_name_prefix, id))
            .spawn(move || run_loop(id, shared, thread_state))
            .expect("Failed to spawn worker thread");
        Worker {
            id,
            state,
            handle: Some(handle),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// The task this worker is busy on, if any.
    pub(crate) fn busy_task(&self) -> Option<TaskId> {
        match *self.state.lock() {
            WorkerState::Busy(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Poll for thread exit until `deadline`. Joins and returns true
    /// if the thread finished in time.
    pub(crate) fn join_until(&mut self, deadline: Instant) -> bool {
        loop {
            if self.is_finished() {
                self.join();
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Detach the thread handle. The thread is left to die with the
    /// process if its payload never returns.
    pub(crate) fn abandon(&mut self) {
        self.handle = None;
    }

    /// Build a worker whose thread has already exited, optionally
    /// stuck at `Busy`. Stands in for a crashed worker.
    #[cfg(test)]
    pub(crate) fn crashed_fixture(id: usize, busy: Option<TaskId>) -> Self {
        let state = Arc::new(Mutex::new(match busy {
            Some(task_id) => WorkerState::Busy(task_id),
            None => WorkerState::Idle,
        }));
        let handle = thread::Builder::new()
            .name(format!("crashed-{}", id))
            .spawn(|| {})
            .expect("Failed to spawn worker thread");
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        Worker {
            id,
            state,
            handle: Some(handle),
        }
    }
}

fn run_loop<T: Send + 'static>(
    id: usize,
    shared: Arc<PoolShared<T>>,
    state: Arc<Mutex<WorkerState>>,
) {
    tracing::debug!(worker_id = id, "worker started");
    while !shared.is_shutdown() {
        match shared.queue.dequeue_timeout(TICK) {
            Dequeue::Item(item) => execute(&shared, &state, item),
            Dequeue::Empty => continue,
            Dequeue::Closed => break,
        }
    }
    *state.lock() = WorkerState::ShuttingDown;
    tracing::debug!(worker_id = id, "worker exiting");
}

fn execute<T: Send + 'static>(
    shared: &Arc<PoolShared<T>>,
    state: &Arc<Mutex<WorkerState>>,
    item: WorkItem<T>,
) {
    let WorkItem {
        id,
        payload,
        deadline,
        slot,
    } = item;

    // Claim the slot. A false return means the task went terminal
    // before any worker touched it (cancelled while queued) and the
    // payload must not run.
    if !slot.begin_execution() {
        return;
    }
    *state.lock() = WorkerState::Busy(id);
    let token = slot.token().clone();

    let outcome = if token.is_cancelled() {
        // Cancellation raced the claim. Still zero payload execution.
        Outcome::Cancelled(token.reason().unwrap_or(CancelReason::Requested))
    } else {
        if let Some(window) = deadline {
            shared.deadline.arm(id, Instant::now() + window);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| payload(&token))) {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(err)) => {
                if token.is_cancelled() {
                    // The payload bailed out in response to the token.
                    Outcome::Cancelled(token.reason().unwrap_or(CancelReason::Requested))
                } else {
                    Outcome::Failure(err)
                }
            }
            Err(panic) => Outcome::Failure(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(&panic)
            )),
        }
    };

    // A worker holding an uncancelled task must own the only terminal
    // write; once the token fired, the cancellation paths may have
    // recorded first and losing that race is expected. An armed timer
    // can also fire between this check and the record, so any task
    // with a deadline records leniently as well.
    let strict = deadline.is_none() && !token.is_cancelled();
    shared.record_terminal(id, outcome, strict);
    *state.lock() = WorkerState::Idle;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
