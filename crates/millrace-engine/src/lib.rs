//! # Millrace
//!
//! Bounded task-execution engine: a fixed pool of worker threads fed
//! by a FIFO queue with backpressure, cooperative cancellation, and
//! write-once outcome collection.
//!
//! ## Architecture
//!
//! - [`Dispatcher`] - lifecycle state machine and submission front end
//! - [`TaskHandle`] - per-task wait, poll, and cancel
//! - [`PoolConfig`] - sizing, timeouts, and retention, loadable from
//!   TOML or the environment
//! - [`Outcome`] - per-task result: success, contained failure, or
//!   cancellation with a reason
//! - [`EventSink`] - fire-and-forget lifecycle notifications, routed
//!   to `tracing` by default
//!
//! Payload failures and panics are contained to their task: the
//! worker records the failure and moves on. Cancellation is
//! cooperative; a running payload is told to stop through its
//! [`CancelToken`] and is never interrupted.
//!
//! ## Example
//!
//! ```
//! use millrace_engine::{Dispatcher, PoolConfig};
//!
//! let dispatcher = Dispatcher::new(PoolConfig::with_workers(4))?;
//! dispatcher.start()?;
//!
//! let handle = dispatcher.submit(|_token| Ok(2 + 2))?;
//! let report = handle.wait()?;
//! assert_eq!(report.outcome.success(), Some(4));
//!
//! dispatcher.shutdown(true)?;
//! # Ok::<(), millrace_engine::PoolError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod collector;
mod config;
mod deadline;
mod dispatcher;
mod error;
mod events;
mod pool;
mod queue;
mod supervisor;
mod task;
mod worker;

pub use config::PoolConfig;
pub use dispatcher::{Dispatcher, DispatcherState, TaskHandle};
pub use error::{PoolError, PoolResult};
pub use events::{EventSink, NoopSink, PoolEvent, TracingSink};
pub use pool::PoolStats;
pub use task::{CancelReason, CancelToken, Outcome, TaskId, TaskReport};
pub use worker::WorkerState;
