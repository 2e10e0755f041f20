//! Lifecycle event notifications
//!
//! The engine reports notable lifecycle moments through an
//! [`EventSink`]. Delivery is fire-and-forget: the engine never blocks
//! on a sink and never changes behavior based on one.

use std::sync::Arc;

use crate::task::{CancelReason, TaskId};

/// A notable pool lifecycle moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A worker thread died and was replaced by the supervisor.
    WorkerReplaced {
        /// Stable index of the replaced worker.
        worker_id: usize,
        /// The task the worker was running when it died, if any.
        task_id: Option<TaskId>,
    },
    /// A task finished with a failure outcome.
    TaskFailed {
        /// The failed task.
        task_id: TaskId,
        /// Rendered error chain.
        error: String,
    },
    /// A task finished cancelled.
    TaskCancelled {
        /// The cancelled task.
        task_id: TaskId,
        /// Why it was cancelled.
        reason: CancelReason,
    },
    /// The pool completed shutdown.
    PoolShutdown {
        /// True if shutdown let claimed tasks run to completion.
        drain: bool,
    },
}

/// Receiver for pool lifecycle events.
///
/// Implementations must be cheap and must not block: events are
/// emitted from worker, supervisor, and shutdown paths.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: PoolEvent);
}

/// Default sink that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PoolEvent) {
        match event {
            PoolEvent::WorkerReplaced { worker_id, task_id } => {
                tracing::warn!(worker_id, ?task_id, "worker replaced");
            }
            PoolEvent::TaskFailed { task_id, error } => {
                tracing::warn!(%task_id, %error, "task failed");
            }
            PoolEvent::TaskCancelled { task_id, reason } => {
                tracing::info!(%task_id, %reason, "task cancelled");
            }
            PoolEvent::PoolShutdown { drain } => {
                tracing::info!(drain, "pool shut down");
            }
        }
    }
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: PoolEvent) {}
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: PoolEvent) {
        (**self).emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<PoolEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: PoolEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_sink_receives_events() {
        let sink = RecordingSink {
            events: Mutex::new(Vec::new()),
        };
        sink.emit(PoolEvent::PoolShutdown { drain: true });
        sink.emit(PoolEvent::TaskCancelled {
            task_id: TaskId::from_u64(3),
            reason: CancelReason::Requested,
        });
        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], PoolEvent::PoolShutdown { drain: true });
    }

    #[test]
    fn test_arc_sink_delegates() {
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn EventSink> = sink.clone();
        as_dyn.emit(PoolEvent::PoolShutdown { drain: false });
        assert_eq!(sink.events.lock().len(), 1);
    }

    #[test]
    fn test_noop_sink_accepts_events() {
        NoopSink.emit(PoolEvent::TaskFailed {
            task_id: TaskId::from_u64(1),
            error: "boom".to_string(),
        });
    }
}
