//! Background supervision: dead worker replacement and retention

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::events::PoolEvent;
use crate::pool::PoolShared;
use crate::task::Outcome;
use crate::worker::Worker;

/// How often the supervisor scans the worker set.
const SCAN_INTERVAL: Duration = Duration::from_millis(25);

/// Owns the supervisor thread.
///
/// The supervisor watches for worker threads that died outside the
/// normal shutdown paths, resolves the task each one was running as a
/// failure, and spawns a replacement so the pool keeps its configured
/// size. It also purges expired outcomes when retention is configured.
pub(crate) struct Supervisor {
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub(crate) fn new() -> Self {
        Supervisor {
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn start<T: Send + 'static>(
        &self,
        shared: Arc<PoolShared<T>>,
        workers: Arc<Mutex<Vec<Worker>>>,
    ) {
        let stop_flag = self.stop_flag.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-supervisor", shared.config.thread_name_prefix))
            .spawn(move || run_supervisor(&stop_flag, &shared, &workers))
            .expect("Failed to spawn supervisor thread");
        *self.handle.lock() = Some(handle);
    }

    /// Stop and join the supervisor thread. Idempotent.
    pub(crate) fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_supervisor<T: Send + 'static>(
    stop_flag: &AtomicBool,
    shared: &Arc<PoolShared<T>>,
    workers: &Mutex<Vec<Worker>>,
) {
    loop {
        thread::sleep(SCAN_INTERVAL);
        // Once the queue closes the pool is shutting down and exited
        // workers are legitimate; replacing them would fight the
        // shutdown path.
        if stop_flag.load(Ordering::Acquire)
            || shared.is_shutdown()
            || shared.queue.is_closed()
        {
            return;
        }
        replace_dead_workers(shared, workers);
        if let Some(retention) = shared.config.outcome_retention {
            let purged = shared.collector.purge_expired(retention);
            if !purged.is_empty() {
                tracing::debug!(count = purged.len(), "purged expired outcomes");
            }
        }
    }
}

fn replace_dead_workers<T: Send + 'static>(
    shared: &Arc<PoolShared<T>>,
    workers: &Mutex<Vec<Worker>>,
) {
    let mut workers = workers.lock();
    for worker in workers.iter_mut() {
        if !worker.is_finished() {
            continue;
        }
        let worker_id = worker.id();
        let orphan = worker.busy_task();
        tracing::warn!(worker_id, task_id = ?orphan, "worker died, replacing");
        if let Some(task_id) = orphan {
            shared.record_terminal(
                task_id,
                Outcome::Failure(anyhow::anyhow!(
                    "worker {} crashed while running task {}",
                    worker_id,
                    task_id
                )),
                false,
            );
        }
        *worker = Worker::spawn(worker_id, shared.clone());
        shared.stats.workers_replaced.fetch_add(1, Ordering::Relaxed);
        shared.events.emit(PoolEvent::WorkerReplaced {
            worker_id,
            task_id: orphan,
        });
    }
}
