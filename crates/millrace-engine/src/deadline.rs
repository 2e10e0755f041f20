//! Deadline enforcement for claimed tasks
//!
//! Workers arm an entry here when they claim a task that carries an
//! execution window. A dedicated timer thread pops due entries and
//! resolves the task as cancelled. Enforcement is cooperative: the
//! payload keeps running and its token tells it to stop; a real
//! outcome that lands first wins and the deadline entry goes stale.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::pool::PoolShared;
use crate::task::{CancelReason, Outcome, TaskId};

struct DeadlineEntry {
    wake_at: Instant,
    task_id: TaskId,
}

// Reversed ordering turns std's max-heap into the min-heap the timer
// needs: the earliest deadline sits on top.
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.task_id == other.task_id
    }
}

impl Eq for DeadlineEntry {}

struct TimerState {
    entries: Mutex<BinaryHeap<DeadlineEntry>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

/// Owns the deadline heap and the timer thread.
pub(crate) struct DeadlineTimer {
    state: Arc<TimerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineTimer {
    pub(crate) fn new() -> Self {
        DeadlineTimer {
            state: Arc::new(TimerState {
                entries: Mutex::new(BinaryHeap::new()),
                condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the timer thread. The dispatcher's state machine ensures
    /// this runs at most once.
    pub(crate) fn start<T: Send + 'static>(&self, shared: Arc<PoolShared<T>>) {
        let state = self.state.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-deadline", shared.config.thread_name_prefix))
            .spawn(move || run_timer(&state, &shared))
            .expect("Failed to spawn deadline timer thread");
        *self.handle.lock() = Some(handle);
    }

    /// Schedule `task_id` to be cancelled at `wake_at`. Entries for
    /// tasks that finish first are stale and fire as no-ops.
    pub(crate) fn arm(&self, task_id: TaskId, wake_at: Instant) {
        let mut entries = self.state.entries.lock();
        entries.push(DeadlineEntry { wake_at, task_id });
        self.state.condvar.notify_one();
    }

    /// Stop and join the timer thread. Idempotent.
    pub(crate) fn stop(&self) {
        {
            let _entries = self.state.entries.lock();
            self.state.shutdown.store(true, Ordering::Release);
            self.state.condvar.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_timer<T>(state: &TimerState, shared: &PoolShared<T>) {
    loop {
        let due = {
            let mut entries = state.entries.lock();
            // Re-check after taking the lock: stop() flips the flag
            // and notifies while holding it.
            if state.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while entries.peek().map_or(false, |entry| entry.wake_at <= now) {
                if let Some(entry) = entries.pop() {
                    due.push(entry.task_id);
                }
            }
            if due.is_empty() {
                match entries.peek().map(|entry| entry.wake_at) {
                    Some(next) => {
                        let _ = state.condvar.wait_until(&mut entries, next);
                    }
                    None => state.condvar.wait(&mut entries),
                }
                if state.shutdown.load(Ordering::Acquire) {
                    return;
                }
            }
            due
        };
        for task_id in due {
            fire(shared, task_id);
        }
    }
}

/// Resolve one due task. Runs without the heap lock so a slow
/// collector never delays other deadlines.
fn fire<T>(shared: &PoolShared<T>, task_id: TaskId) {
    let slot = match shared.collector.get(task_id) {
        Some(slot) => slot,
        None => return,
    };
    if !slot.is_pending() {
        return;
    }
    tracing::debug!(%task_id, "task deadline elapsed");
    slot.token().cancel_with(CancelReason::DeadlineExceeded);
    shared.record_terminal(
        task_id,
        Outcome::Cancelled(CancelReason::DeadlineExceeded),
        false,
    );
}
