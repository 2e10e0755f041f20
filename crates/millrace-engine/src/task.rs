//! Task identity, cancellation, and per-task outcome slots

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PoolError, PoolResult};

/// Global counter for generating unique task IDs
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a submitted task.
///
/// IDs are allocated from a process-wide monotonically increasing
/// counter, so they are unique across every pool in the process and
/// later submissions always carry larger IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next task ID.
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Rebuild a task ID from its raw value.
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Boxed task payload: receives the task's cancellation token and
/// produces the task's value or error.
pub(crate) type Payload<T> = Box<dyn FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static>;

/// Why a task was cancelled. The first cancellation request wins and
/// its reason is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A caller asked for cancellation through a handle.
    Requested,
    /// The task's execution window elapsed before it finished.
    DeadlineExceeded,
    /// The pool shut down before the task could run to completion.
    Shutdown,
    /// The worker running the task was abandoned after the shutdown
    /// grace period expired.
    ForcedShutdown,
}

impl CancelReason {
    fn code(self) -> u8 {
        match self {
            CancelReason::Requested => 1,
            CancelReason::DeadlineExceeded => 2,
            CancelReason::Shutdown => 3,
            CancelReason::ForcedShutdown => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CancelReason::Requested),
            2 => Some(CancelReason::DeadlineExceeded),
            3 => Some(CancelReason::Shutdown),
            4 => Some(CancelReason::ForcedShutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CancelReason::Requested => "requested",
            CancelReason::DeadlineExceeded => "deadline exceeded",
            CancelReason::Shutdown => "shutdown",
            CancelReason::ForcedShutdown => "forced shutdown",
        };
        write!(f, "{}", name)
    }
}

struct TokenInner {
    cancelled: AtomicBool,
    reason: AtomicU8,
    flag: Mutex<bool>,
    condvar: Condvar,
}

/// Cooperative cancellation signal shared between the engine and one
/// task's payload.
///
/// The engine never interrupts a running payload. It sets this token
/// and the payload decides when (and whether) to observe it, either by
/// polling [`is_cancelled`](CancelToken::is_cancelled) between work
/// steps or by sleeping in cancellable slices with
/// [`wait_timeout`](CancelToken::wait_timeout). A payload that returns
/// an error while its token is set is reported as cancelled, not
/// failed; a payload that returns a value anyway has its value
/// recorded normally.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: AtomicU8::new(0),
                flag: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request cancellation on behalf of a caller.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Requested);
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        // First reason wins; the flag store is ordered after it so a
        // reader that observes the flag also observes the reason.
        let _ = self.inner.reason.compare_exchange(
            0,
            reason.code(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.cancelled.store(true, Ordering::Release);
        let mut flagged = self.inner.flag.lock();
        *flagged = true;
        self.inner.condvar.notify_all();
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The reason for the cancellation request, if one was made.
    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_code(self.inner.reason.load(Ordering::Acquire))
    }

    /// Sleep for at most `timeout`, waking early if cancellation is
    /// requested. Returns true if the token was cancelled.
    ///
    /// This is the building block for IO-style payloads that want to
    /// wait in cancellable slices instead of plain `thread::sleep`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut flagged = self.inner.flag.lock();
        while !*flagged {
            if self
                .inner
                .condvar
                .wait_until(&mut flagged, deadline)
                .timed_out()
            {
                break;
            }
        }
        *flagged
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Terminal result of a task. Written exactly once.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The payload completed and produced a value.
    Success(T),
    /// The payload returned an error or panicked. The failure is fully
    /// contained to this task.
    Failure(anyhow::Error),
    /// The task was cancelled before producing a real outcome.
    Cancelled(CancelReason),
}

impl<T> Outcome<T> {
    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// True for `Failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled(_))
    }

    /// Extract the success value.
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Extract the failure error.
    pub fn failure(self) -> Option<anyhow::Error> {
        match self {
            Outcome::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// The cancellation reason, if cancelled.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Outcome::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// A retrieved outcome plus the metadata callers may order by.
///
/// Completion order is unordered across workers; callers that need
/// submission order sort their reports by `sequence`.
#[derive(Debug)]
pub struct TaskReport<T> {
    /// The task this report belongs to.
    pub task_id: TaskId,
    /// Per-pool submission index, strictly increasing in submit order.
    pub sequence: u64,
    /// Time from submission to the terminal outcome.
    pub elapsed: Duration,
    /// The terminal outcome.
    pub outcome: Outcome<T>,
}

enum SlotState<T> {
    Pending { claimed: bool },
    Done { outcome: Outcome<T>, completed_at: Instant },
    Retrieved,
}

/// Result of a non-destructive-until-terminal slot read.
pub(crate) enum SlotPoll<T> {
    /// No outcome yet.
    Pending,
    /// The outcome, taken out of the slot. The slot will answer
    /// `Retrieved` from now on.
    Report(TaskReport<T>),
    /// The outcome was already taken by an earlier call.
    Retrieved,
}

/// Shared per-task state: claim flag, write-once outcome, and the
/// condvar callers block on.
///
/// One slot exists per submitted task, registered in the collector and
/// referenced by the queue item and the caller's handle.
pub(crate) struct TaskSlot<T> {
    id: TaskId,
    sequence: u64,
    submitted_at: Instant,
    token: CancelToken,
    state: Mutex<SlotState<T>>,
    condvar: Condvar,
}

impl<T> TaskSlot<T> {
    pub(crate) fn new(id: TaskId, sequence: u64) -> Self {
        TaskSlot {
            id,
            sequence,
            submitted_at: Instant::now(),
            token: CancelToken::new(),
            state: Mutex::new(SlotState::Pending { claimed: false }),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Mark the slot claimed by a worker. Returns false if the task is
    /// already terminal, in which case the payload must not run.
    pub(crate) fn begin_execution(&self) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            SlotState::Pending { claimed } => {
                *claimed = true;
                true
            }
            _ => false,
        }
    }

    /// `Some(claimed)` while pending, `None` once terminal.
    pub(crate) fn pending_claim_state(&self) -> Option<bool> {
        match &*self.state.lock() {
            SlotState::Pending { claimed } => Some(*claimed),
            _ => None,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending_claim_state().is_some()
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.pending_claim_state() == Some(true)
    }

    /// Record the terminal outcome. Fails with `DuplicateOutcome` if
    /// the slot is already terminal.
    pub(crate) fn record(&self, outcome: Outcome<T>) -> PoolResult<()> {
        let mut state = self.state.lock();
        if matches!(&*state, SlotState::Pending { .. }) {
            *state = SlotState::Done {
                outcome,
                completed_at: Instant::now(),
            };
            drop(state);
            self.condvar.notify_all();
            Ok(())
        } else {
            Err(PoolError::DuplicateOutcome(self.id))
        }
    }

    /// First-writer-wins record for the cancellation paths, where
    /// losing the race to a real outcome is expected.
    pub(crate) fn try_record(&self, outcome: Outcome<T>) -> bool {
        self.record(outcome).is_ok()
    }

    /// Record only if no worker has claimed the slot. The check and
    /// the write happen under one lock, so a task is either resolved
    /// here or left to its worker, never both.
    pub(crate) fn try_record_unclaimed(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Pending { claimed: false } => {
                *state = SlotState::Done {
                    outcome,
                    completed_at: Instant::now(),
                };
                drop(state);
                self.condvar.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Take the outcome if terminal. One-shot.
    pub(crate) fn take_report(&self) -> SlotPoll<T> {
        let mut state = self.state.lock();
        self.take_locked(&mut state)
    }

    /// Block until terminal (or until `timeout` elapses), then take
    /// the outcome. One-shot.
    pub(crate) fn wait_report(&self, timeout: Option<Duration>) -> SlotPoll<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while matches!(&*state, SlotState::Pending { .. }) {
            match deadline {
                Some(at) => {
                    if self.condvar.wait_until(&mut state, at).timed_out() {
                        break;
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
        self.take_locked(&mut state)
    }

    fn take_locked(&self, state: &mut SlotState<T>) -> SlotPoll<T> {
        match std::mem::replace(state, SlotState::Retrieved) {
            SlotState::Done {
                outcome,
                completed_at,
            } => SlotPoll::Report(TaskReport {
                task_id: self.id,
                sequence: self.sequence,
                elapsed: completed_at.duration_since(self.submitted_at),
                outcome,
            }),
            SlotState::Pending { claimed } => {
                *state = SlotState::Pending { claimed };
                SlotPoll::Pending
            }
            SlotState::Retrieved => SlotPoll::Retrieved,
        }
    }

    /// True if the outcome has sat unretrieved longer than `retention`.
    pub(crate) fn expired(&self, retention: Duration, now: Instant) -> bool {
        match &*self.state.lock() {
            SlotState::Done { completed_at, .. } => {
                now.duration_since(*completed_at) > retention
            }
            _ => false,
        }
    }
}
