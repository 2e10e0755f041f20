//! Outcome registry: write-once results keyed by task ID

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{PoolError, PoolResult};
use crate::task::{Outcome, SlotPoll, TaskId, TaskReport, TaskSlot};

/// Tracks every in-flight task's slot and serves outcome retrieval.
///
/// A slot stays registered until its outcome is retrieved (or purged
/// by the retention sweep), so late lookups of consumed or never-known
/// tasks both answer `UnknownTask`.
pub(crate) struct ResultCollector<T> {
    slots: DashMap<TaskId, Arc<TaskSlot<T>>>,
}

impl<T> ResultCollector<T> {
    pub(crate) fn new() -> Self {
        ResultCollector {
            slots: DashMap::new(),
        }
    }

    /// Register a freshly submitted task's slot.
    pub(crate) fn register(&self, slot: Arc<TaskSlot<T>>) {
        self.slots.insert(slot.id(), slot);
    }

    /// Drop a slot without retrieving it. Used when a submission is
    /// rolled back after the queue refuses it.
    pub(crate) fn unregister(&self, id: TaskId) -> Option<Arc<TaskSlot<T>>> {
        self.slots.remove(&id).map(|(_, slot)| slot)
    }

    /// Look up a slot. The Arc is cloned out immediately so no map
    /// shard stays locked while the caller blocks on the slot.
    pub(crate) fn get(&self, id: TaskId) -> Option<Arc<TaskSlot<T>>> {
        self.slots.get(&id).map(|entry| entry.clone())
    }

    /// Record the terminal outcome for `id`. Fails with `UnknownTask`
    /// for unregistered IDs and `DuplicateOutcome` for tasks that are
    /// already terminal.
    pub(crate) fn record(&self, id: TaskId, outcome: Outcome<T>) -> PoolResult<()> {
        match self.get(id) {
            Some(slot) => slot.record(outcome),
            None => Err(PoolError::UnknownTask(id)),
        }
    }

    /// First-writer-wins record. Returns true if this call supplied
    /// the terminal outcome.
    pub(crate) fn try_record(&self, id: TaskId, outcome: Outcome<T>) -> bool {
        match self.get(id) {
            Some(slot) => slot.try_record(outcome),
            None => false,
        }
    }

    /// Record only if no worker has claimed the task. Used by the
    /// shutdown sweeps to resolve queued work without racing the
    /// workers for claimed slots.
    pub(crate) fn try_record_unclaimed(&self, id: TaskId, outcome: Outcome<T>) -> bool {
        match self.get(id) {
            Some(slot) => slot.try_record_unclaimed(outcome),
            None => false,
        }
    }

    /// Block until `id` has an outcome, then take it. The slot is
    /// removed on success, so a second retrieval answers
    /// `UnknownTask`.
    pub(crate) fn wait_for(
        &self,
        id: TaskId,
        timeout: Option<Duration>,
    ) -> PoolResult<TaskReport<T>> {
        let slot = self.get(id).ok_or(PoolError::UnknownTask(id))?;
        match slot.wait_report(timeout) {
            SlotPoll::Report(report) => {
                self.slots.remove(&id);
                Ok(report)
            }
            SlotPoll::Pending => Err(PoolError::WaitTimeout(id)),
            SlotPoll::Retrieved => Err(PoolError::UnknownTask(id)),
        }
    }

    /// Non-blocking retrieval: `Ok(None)` while the task is still in
    /// flight, `Ok(Some(report))` exactly once when it is terminal.
    pub(crate) fn poll(&self, id: TaskId) -> PoolResult<Option<TaskReport<T>>> {
        let slot = self.get(id).ok_or(PoolError::UnknownTask(id))?;
        match slot.take_report() {
            SlotPoll::Report(report) => {
                self.slots.remove(&id);
                Ok(Some(report))
            }
            SlotPoll::Pending => Ok(None),
            SlotPoll::Retrieved => Err(PoolError::UnknownTask(id)),
        }
    }

    /// Number of registered tasks that have no outcome yet.
    pub(crate) fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().is_pending())
            .count()
    }

    /// Snapshot of pending tasks as `(id, claimed)` pairs.
    pub(crate) fn pending_tasks(&self) -> Vec<(TaskId, bool)> {
        self.slots
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .pending_claim_state()
                    .map(|claimed| (*entry.key(), claimed))
            })
            .collect()
    }

    /// Remove outcomes that have sat unretrieved longer than
    /// `retention`. Returns the purged IDs.
    pub(crate) fn purge_expired(&self, retention: Duration) -> Vec<TaskId> {
        let now = Instant::now();
        let expired: Vec<TaskId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().expired(retention, now))
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.slots.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CancelReason;
    use std::thread;

    fn create_collector() -> (ResultCollector<u32>, TaskId) {
        let collector = ResultCollector::new();
        let id = TaskId::new();
        collector.register(Arc::new(TaskSlot::new(id, 0)));
        (collector, id)
    }

    #[test]
    fn test_record_and_wait() {
        let (collector, id) = create_collector();
        collector.record(id, Outcome::Success(42)).unwrap();
        let report = collector.wait_for(id, None).unwrap();
        assert_eq!(report.task_id, id);
        assert_eq!(report.outcome.success(), Some(42));
        // Retrieval consumed the slot.
        let err = collector.wait_for(id, None).unwrap_err();
        assert!(matches!(err, PoolError::UnknownTask(_)));
    }

    #[test]
    fn test_wait_for_timeout() {
        let (collector, id) = create_collector();
        let err = collector
            .wait_for(id, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, PoolError::WaitTimeout(t) if t == id));
        // The task is still pending and retrievable afterwards.
        collector.record(id, Outcome::Success(1)).unwrap();
        assert!(collector.wait_for(id, None).is_ok());
    }

    #[test]
    fn test_wait_for_unknown_task() {
        let collector: ResultCollector<u32> = ResultCollector::new();
        let err = collector.wait_for(TaskId::new(), None).unwrap_err();
        assert!(matches!(err, PoolError::UnknownTask(_)));
    }

    #[test]
    fn test_wait_wakes_on_record() {
        let collector = Arc::new(ResultCollector::<u32>::new());
        let id = TaskId::new();
        collector.register(Arc::new(TaskSlot::new(id, 0)));

        let writer_collector = collector.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer_collector
                .record(id, Outcome::Cancelled(CancelReason::Requested))
                .unwrap();
        });

        let report = collector.wait_for(id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(report.outcome.cancel_reason(), Some(CancelReason::Requested));
        writer.join().unwrap();
    }

    #[test]
    fn test_poll_pending_then_report() {
        let (collector, id) = create_collector();
        assert!(collector.poll(id).unwrap().is_none());
        collector.record(id, Outcome::Success(5)).unwrap();
        let report = collector.poll(id).unwrap().unwrap();
        assert_eq!(report.outcome.success(), Some(5));
        assert!(matches!(
            collector.poll(id).unwrap_err(),
            PoolError::UnknownTask(_)
        ));
    }

    #[test]
    fn test_record_unknown_task() {
        let collector: ResultCollector<u32> = ResultCollector::new();
        let err = collector.record(TaskId::new(), Outcome::Success(1)).unwrap_err();
        assert!(matches!(err, PoolError::UnknownTask(_)));
        assert!(!collector.try_record(TaskId::new(), Outcome::Success(1)));
    }

    #[test]
    fn test_duplicate_record_is_loud() {
        let (collector, id) = create_collector();
        collector.record(id, Outcome::Success(1)).unwrap();
        let err = collector.record(id, Outcome::Success(2)).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateOutcome(t) if t == id));
        // The first outcome is untouched.
        let report = collector.wait_for(id, None).unwrap();
        assert_eq!(report.outcome.success(), Some(1));
    }

    #[test]
    fn test_try_record_loses_race_silently() {
        let (collector, id) = create_collector();
        assert!(collector.try_record(id, Outcome::Success(1)));
        assert!(!collector.try_record(id, Outcome::Cancelled(CancelReason::Shutdown)));
    }

    #[test]
    fn test_try_record_unclaimed_respects_claims() {
        let (collector, id) = create_collector();
        collector.get(id).unwrap().begin_execution();
        assert!(!collector.try_record_unclaimed(id, Outcome::Cancelled(CancelReason::Shutdown)));

        let waiting = TaskId::new();
        collector.register(Arc::new(TaskSlot::new(waiting, 1)));
        assert!(collector.try_record_unclaimed(waiting, Outcome::Cancelled(CancelReason::Shutdown)));
        assert!(!collector.try_record_unclaimed(TaskId::new(), Outcome::Success(1)));
    }

    #[test]
    fn test_pending_tasks_snapshot() {
        let collector: ResultCollector<u32> = ResultCollector::new();
        let claimed = TaskId::new();
        let waiting = TaskId::new();
        let done = TaskId::new();
        let claimed_slot = Arc::new(TaskSlot::new(claimed, 0));
        claimed_slot.begin_execution();
        collector.register(claimed_slot);
        collector.register(Arc::new(TaskSlot::new(waiting, 1)));
        collector.register(Arc::new(TaskSlot::new(done, 2)));
        collector.record(done, Outcome::Success(1)).unwrap();

        let mut pending = collector.pending_tasks();
        pending.sort();
        assert_eq!(pending, vec![(claimed, true), (waiting, false)]);
        assert_eq!(collector.pending_count(), 2);
    }

    #[test]
    fn test_purge_expired() {
        let (collector, id) = create_collector();
        collector.record(id, Outcome::Success(1)).unwrap();
        assert!(collector.purge_expired(Duration::from_secs(60)).is_empty());

        thread::sleep(Duration::from_millis(5));
        let purged = collector.purge_expired(Duration::ZERO);
        assert_eq!(purged, vec![id]);
        assert!(matches!(
            collector.wait_for(id, None).unwrap_err(),
            PoolError::UnknownTask(_)
        ));
    }

    #[test]
    fn test_purge_skips_pending() {
        let (collector, _id) = create_collector();
        thread::sleep(Duration::from_millis(5));
        assert!(collector.purge_expired(Duration::ZERO).is_empty());
        assert_eq!(collector.pending_count(), 1);
    }
}
