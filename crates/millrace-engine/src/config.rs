//! Pool configuration loading and validation

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Configuration for a dispatcher and its worker pool.
///
/// Durations are expressed in milliseconds in the TOML form and in the
/// environment overrides; the in-memory form uses [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads. Must be at least 1.
    pub worker_count: usize,
    /// Task queue capacity. 0 means unbounded; submissions then never
    /// block on queue space.
    pub queue_capacity: usize,
    /// Execution window applied to every task that does not set its
    /// own. `None` means tasks run without a deadline.
    #[serde(
        rename = "default_task_timeout_ms",
        with = "opt_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_task_timeout: Option<Duration>,
    /// How long a forced shutdown waits for busy workers before
    /// abandoning them.
    #[serde(rename = "shutdown_grace_ms", with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// How long an unretrieved outcome is kept before the supervisor
    /// purges it. `None` keeps outcomes until retrieved.
    #[serde(
        rename = "outcome_retention_ms",
        with = "opt_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub outcome_retention: Option<Duration>,
    /// Prefix for engine thread names.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            worker_count: num_cpus::get(),
            queue_capacity: 0,
            default_task_timeout: None,
            shutdown_grace: Duration::from_secs(2),
            outcome_retention: None,
            thread_name_prefix: "millrace".to_string(),
        }
    }
}

impl PoolConfig {
    /// Create a config with the given worker count and the defaults
    /// for everything else.
    pub fn with_workers(worker_count: usize) -> Self {
        PoolConfig {
            worker_count,
            ..Default::default()
        }
    }

    /// Load a config from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a config from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> PoolResult<Self> {
        let config: PoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from `MILLRACE_*` environment variables, falling
    /// back to the defaults for anything unset.
    ///
    /// Recognized variables: `MILLRACE_WORKERS`,
    /// `MILLRACE_QUEUE_CAPACITY`, `MILLRACE_TASK_TIMEOUT_MS`,
    /// `MILLRACE_SHUTDOWN_GRACE_MS`, `MILLRACE_OUTCOME_RETENTION_MS`,
    /// `MILLRACE_THREAD_PREFIX`.
    pub fn from_env() -> PoolResult<Self> {
        let mut config = PoolConfig::default();
        if let Some(workers) = env_parse::<usize>("MILLRACE_WORKERS")? {
            config.worker_count = workers;
        }
        if let Some(capacity) = env_parse::<usize>("MILLRACE_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(ms) = env_parse::<u64>("MILLRACE_TASK_TIMEOUT_MS")? {
            config.default_task_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("MILLRACE_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("MILLRACE_OUTCOME_RETENTION_MS")? {
            config.outcome_retention = Some(Duration::from_millis(ms));
        }
        if let Ok(prefix) = std::env::var("MILLRACE_THREAD_PREFIX") {
            config.thread_name_prefix = prefix;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints.
    pub fn validate(&self) -> PoolResult<()> {
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.shutdown_grace.is_zero() {
            return Err(PoolError::InvalidConfig(
                "shutdown_grace_ms must be non-zero".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(PoolError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> PoolResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse::<T>()
                .map_err(|e| PoolError::InvalidConfig(format!("{}: {}", name, e)))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
