//! Engine error taxonomy

use crate::dispatcher::DispatcherState;
use crate::task::TaskId;
use thiserror::Error;

/// Errors surfaced at the engine API boundary.
///
/// Payload errors are never represented here. A failing payload is
/// captured as an [`Outcome::Failure`](crate::Outcome::Failure) for its
/// own task and stays fully isolated from other tasks and from the
/// engine itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue no longer accepts work because shutdown has begun.
    #[error("task queue is closed")]
    QueueClosed,

    /// Submission attempted while the dispatcher is not running.
    #[error("dispatcher is not running (state: {0})")]
    DispatcherNotRunning(DispatcherState),

    /// `start()` was called on a dispatcher that already left the
    /// `Created` state.
    #[error("dispatcher already started")]
    AlreadyStarted,

    /// An outcome was already recorded for this task. This signals a
    /// bug in the engine itself, never bad caller input.
    #[error("outcome already recorded for task {0}")]
    DuplicateOutcome(TaskId),

    /// A bounded wait elapsed before the task finished. The task keeps
    /// running and the wait may be retried.
    #[error("timed out waiting for task {0}")]
    WaitTimeout(TaskId),

    /// The task id is unknown: never submitted here, already
    /// retrieved, or purged after the retention window.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// A configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type used throughout the engine.
pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::DuplicateOutcome(TaskId::from_u64(7));
        assert_eq!(err.to_string(), "outcome already recorded for task 7");

        let err = PoolError::DispatcherNotRunning(DispatcherState::Stopped);
        assert_eq!(
            err.to_string(),
            "dispatcher is not running (state: Stopped)"
        );
    }

    #[test]
    fn test_config_parse_error_from() {
        let parse_err = toml::from_str::<toml::Value>("not = = valid").unwrap_err();
        let err: PoolError = parse_err.into();
        assert!(matches!(err, PoolError::ConfigParse(_)));
    }
}
