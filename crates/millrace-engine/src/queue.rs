//! Bounded FIFO task queue with close semantics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::error::{PoolError, PoolResult};
use crate::task::{Payload, TaskId, TaskSlot};

/// Poll interval for blocking queue operations. Blocked producers and
/// consumers re-check closed state at this cadence, so closing the
/// queue is observed within one tick.
pub(crate) const TICK: Duration = Duration::from_millis(50);

/// One queued unit of work.
pub(crate) struct WorkItem<T> {
    pub(crate) id: TaskId,
    pub(crate) payload: Payload<T>,
    pub(crate) deadline: Option<Duration>,
    pub(crate) slot: Arc<TaskSlot<T>>,
}

/// Verdict of a timed dequeue attempt.
pub(crate) enum Dequeue<T> {
    /// An item was claimed.
    Item(WorkItem<T>),
    /// Nothing available yet; the queue is still open (or still
    /// draining).
    Empty,
    /// The queue is closed and drained. No item will ever arrive.
    Closed,
}

/// Thread-safe FIFO handing tasks from producers to workers.
///
/// A bounded queue applies backpressure: `enqueue` blocks while the
/// queue is full. Closing the queue fails pending and future enqueues
/// but lets consumers drain what was already accepted.
pub(crate) struct TaskQueue<T> {
    tx: Sender<WorkItem<T>>,
    rx: Receiver<WorkItem<T>>,
    closed: AtomicBool,
}

impl<T> TaskQueue<T> {
    /// Create a queue. `capacity` 0 means unbounded.
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 {
            channel::unbounded()
        } else {
            channel::bounded(capacity)
        };
        TaskQueue {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Add an item, blocking while the queue is at capacity. Fails
    /// with `QueueClosed` once the queue is closed, including for
    /// producers already blocked on space.
    pub(crate) fn enqueue(&self, item: WorkItem<T>) -> PoolResult<()> {
        let mut item = item;
        loop {
            if self.is_closed() {
                return Err(PoolError::QueueClosed);
            }
            match self.tx.send_timeout(item, TICK) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(PoolError::QueueClosed),
            }
        }
    }

    /// Try to claim the oldest item, waiting at most `timeout`.
    pub(crate) fn dequeue_timeout(&self, timeout: Duration) -> Dequeue<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Dequeue::Item(item),
            Err(RecvTimeoutError::Timeout) => {
                if self.is_closed() && self.rx.is_empty() {
                    Dequeue::Closed
                } else {
                    Dequeue::Empty
                }
            }
            Err(RecvTimeoutError::Disconnected) => Dequeue::Closed,
        }
    }

    /// Close the queue. Idempotent. Consumers still drain accepted
    /// items; producers fail from here on.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of items currently queued (not yet claimed).
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    /// Configured capacity, 0 for unbounded.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn create_item(value: u32) -> WorkItem<u32> {
        let id = TaskId::new();
        WorkItem {
            id,
            payload: Box::new(move |_| Ok(value)),
            deadline: None,
            slot: Arc::new(TaskSlot::new(id, value as u64)),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue: TaskQueue<u32> = TaskQueue::new(8);
        for value in 0..5 {
            queue.enqueue(create_item(value)).unwrap();
        }
        let mut seen = Vec::new();
        while let Dequeue::Item(item) = queue.dequeue_timeout(Duration::from_millis(10)) {
            seen.push((item.payload)(item.slot.token()).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_len_and_capacity() {
        let queue: TaskQueue<u32> = TaskQueue::new(8);
        assert_eq!(queue.len(), 0);
        queue.enqueue(create_item(1)).unwrap();
        queue.enqueue(create_item(2)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 8);
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let queue: TaskQueue<u32> = TaskQueue::new(0);
        assert_eq!(queue.capacity(), 0);
        let start = Instant::now();
        for value in 0..1000 {
            queue.enqueue(create_item(value)).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn test_enqueue_blocks_when_full() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new(1));
        queue.enqueue(create_item(1)).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let producer_queue = queue.clone();
        let producer_done = done.clone();
        let producer = thread::spawn(move || {
            producer_queue.enqueue(create_item(2)).unwrap();
            producer_done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        assert!(matches!(
            queue.dequeue_timeout(Duration::from_millis(100)),
            Dequeue::Item(_)
        ));
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let queue: TaskQueue<u32> = TaskQueue::new(4);
        queue.close();
        let err = queue.enqueue(create_item(1)).unwrap_err();
        assert!(matches!(err, PoolError::QueueClosed));
    }

    #[test]
    fn test_close_wakes_blocked_enqueue() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new(1));
        queue.enqueue(create_item(1)).unwrap();

        let producer_queue = queue.clone();
        let producer = thread::spawn(move || producer_queue.enqueue(create_item(2)));

        thread::sleep(Duration::from_millis(30));
        queue.close();
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(PoolError::QueueClosed)));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let queue: TaskQueue<u32> = TaskQueue::new(4);
        queue.enqueue(create_item(1)).unwrap();
        queue.enqueue(create_item(2)).unwrap();
        queue.close();

        assert!(matches!(
            queue.dequeue_timeout(Duration::from_millis(10)),
            Dequeue::Item(_)
        ));
        assert!(matches!(
            queue.dequeue_timeout(Duration::from_millis(10)),
            Dequeue::Item(_)
        ));
        assert!(matches!(
            queue.dequeue_timeout(Duration::from_millis(60)),
            Dequeue::Closed
        ));
    }

    #[test]
    fn test_dequeue_empty_open_queue() {
        let queue: TaskQueue<u32> = TaskQueue::new(4);
        assert!(matches!(
            queue.dequeue_timeout(Duration::from_millis(10)),
            Dequeue::Empty
        ));
    }
}
