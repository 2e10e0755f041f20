//! Configuration loading and event sink integration.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use millrace_engine::{
    CancelReason, Dispatcher, EventSink, PoolConfig, PoolError, PoolEvent,
};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingSink {
    fn snapshot(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PoolEvent) {
        self.events.lock().push(event);
    }
}

#[test]
fn test_config_from_file_drives_a_pool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        b"worker_count = 2\n\
          queue_capacity = 4\n\
          shutdown_grace_ms = 750\n\
          thread_name_prefix = \"filepool\"\n",
    )
    .unwrap();

    let config = PoolConfig::from_file(file.path()).unwrap();
    assert_eq!(config.worker_count, 2);
    assert_eq!(config.queue_capacity, 4);
    assert_eq!(config.shutdown_grace, Duration::from_millis(750));
    assert_eq!(config.thread_name_prefix, "filepool");

    let dispatcher: Dispatcher<u32> = Dispatcher::new(config).unwrap();
    dispatcher.start().unwrap();
    let handle = dispatcher.submit(|_| Ok(3)).unwrap();
    assert_eq!(
        handle
            .wait_timeout(Duration::from_secs(10))
            .unwrap()
            .outcome
            .success(),
        Some(3)
    );
    dispatcher.shutdown(true).unwrap();
}

#[test]
fn test_config_from_missing_file() {
    let err = PoolConfig::from_file("/nonexistent/millrace.toml").unwrap_err();
    assert!(matches!(err, PoolError::ConfigIo(_)));
}

#[test]
fn test_config_from_env() {
    std::env::set_var("MILLRACE_WORKERS", "3");
    std::env::set_var("MILLRACE_QUEUE_CAPACITY", "9");
    std::env::set_var("MILLRACE_TASK_TIMEOUT_MS", "250");

    let config = PoolConfig::from_env().unwrap();
    assert_eq!(config.worker_count, 3);
    assert_eq!(config.queue_capacity, 9);
    assert_eq!(
        config.default_task_timeout,
        Some(Duration::from_millis(250))
    );

    std::env::set_var("MILLRACE_WORKERS", "zero");
    assert!(matches!(
        PoolConfig::from_env().unwrap_err(),
        PoolError::InvalidConfig(_)
    ));

    std::env::remove_var("MILLRACE_WORKERS");
    std::env::remove_var("MILLRACE_QUEUE_CAPACITY");
    std::env::remove_var("MILLRACE_TASK_TIMEOUT_MS");
}

#[test]
fn test_events_flow_through_custom_sink() {
    let sink = Arc::new(RecordingSink::default());
    let config = PoolConfig {
        worker_count: 1,
        queue_capacity: 8,
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    };
    let dispatcher: Dispatcher<u32> = Dispatcher::with_event_sink(config, sink.clone()).unwrap();
    dispatcher.start().unwrap();

    // A success produces no event.
    let ok = dispatcher.submit(|_| Ok(1)).unwrap();
    ok.wait_timeout(Duration::from_secs(10)).unwrap();

    let failed = dispatcher
        .submit(|_| Err(anyhow::anyhow!("no good")))
        .unwrap();
    failed.wait_timeout(Duration::from_secs(10)).unwrap();

    // Hold the worker so the next task can be cancelled while queued.
    let blocker = dispatcher
        .submit(|_| {
            thread::sleep(Duration::from_millis(100));
            Ok(0)
        })
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    let cancelled = dispatcher.submit(|_| Ok(2)).unwrap();
    cancelled.cancel();
    cancelled.wait_timeout(Duration::from_secs(10)).unwrap();
    blocker.wait_timeout(Duration::from_secs(10)).unwrap();

    dispatcher.shutdown(true).unwrap();

    let events = sink.snapshot();
    assert!(events.iter().any(|event| matches!(
        event,
        PoolEvent::TaskFailed { task_id, error }
            if *task_id == failed.id() && error.contains("no good")
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        PoolEvent::TaskCancelled {
            task_id,
            reason: CancelReason::Requested,
        } if *task_id == cancelled.id()
    )));
    assert_eq!(events.last(), Some(&PoolEvent::PoolShutdown { drain: true }));
    // The success never reached the sink.
    assert!(!events.iter().any(|event| matches!(
        event,
        PoolEvent::TaskFailed { task_id, .. } if *task_id == ok.id()
    )));
}

#[test]
fn test_retention_discards_unretrieved_outcomes() {
    let config = PoolConfig {
        worker_count: 1,
        queue_capacity: 8,
        outcome_retention: Some(Duration::from_millis(250)),
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    };
    let dispatcher: Dispatcher<u32> = Dispatcher::new(config).unwrap();
    dispatcher.start().unwrap();

    let handle = dispatcher.submit(|_| Ok(9)).unwrap();
    // Never retrieved; the supervisor's sweep discards it.
    thread::sleep(Duration::from_secs(1));
    assert!(matches!(
        handle.wait().unwrap_err(),
        PoolError::UnknownTask(_)
    ));

    // Prompt retrieval still works under retention.
    let prompt = dispatcher.submit(|_| Ok(10)).unwrap();
    let report = prompt.wait_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(report.outcome.success(), Some(10));

    dispatcher.shutdown(true).unwrap();
}
