//! Configuration loading and representation.
//!
//! Every component receives its own config struct at construction; nothing
//! here is process-global. `PipelineConfig::from_env` is the only place that
//! reads environment variables.

use core::str::FromStr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use corejobs_observability::LogFormat;

use crate::worker::retry::{BackoffStrategy, RetryPolicy};

/// Configuration error (fails startup).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("{key} must be set when {reason}")]
    Missing {
        key: &'static str,
        reason: &'static str,
    },
}

/// Page-size defaults and caps for the query service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Used when the caller omits `limit` or passes a value < 1.
    pub default_limit: u32,
    /// Hard cap on `limit`.
    pub max_limit: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 100,
        }
    }
}

/// Submission behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionConfig {
    /// How long a terminal job still resolves resubmissions of its reference id.
    pub duplicate_window: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown queue backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    pub stream_key: String,
    pub group: String,
    /// Unacknowledged deliveries become visible again after this long.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            stream_key: "corejobs:work".to_string(),
            group: "corejobs.workers".to_string(),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Name for logging (and Redis consumer names).
    pub name: String,
    /// Concurrent worker tasks in this pool.
    pub concurrency: usize,
    /// Long-poll wait per dequeue.
    pub poll_wait: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "corejobs-worker".to_string(),
            concurrency: 4,
            poll_wait: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlersConfig {
    /// Simulated work time of a connection test.
    pub connection_test_delay: Duration,
    /// Instruments per committed import batch.
    pub import_batch_size: usize,
    /// CSV file of instruments to import; none means an empty source.
    pub import_file: Option<PathBuf>,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            connection_test_delay: Duration::from_secs(2),
            import_batch_size: 500,
            import_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub bind_addr: SocketAddr,
    /// Run a worker pool inside the API process.
    pub embedded_workers: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            embedded_workers: true,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    pub log_format: LogFormat,
    pub http: HttpConfig,
    pub pagination: PaginationConfig,
    pub ingestion: IngestionConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub handlers: HandlersConfig,
}

impl PipelineConfig {
    /// Build the configuration from `COREJOBS_*` environment variables
    /// (plus `DATABASE_URL`, `REDIS_URL`), falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let defaults = PipelineConfig::default();

        let pagination = PaginationConfig {
            default_limit: env.parse("COREJOBS_PAGE_DEFAULT_LIMIT", defaults.pagination.default_limit)?,
            max_limit: env.parse("COREJOBS_PAGE_MAX_LIMIT", defaults.pagination.max_limit)?,
        };
        if pagination.max_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "COREJOBS_PAGE_MAX_LIMIT",
                message: "must be at least 1".to_string(),
            });
        }
        if pagination.default_limit == 0 || pagination.default_limit > pagination.max_limit {
            return Err(ConfigError::Invalid {
                key: "COREJOBS_PAGE_DEFAULT_LIMIT",
                message: format!("must be between 1 and {}", pagination.max_limit),
            });
        }

        let ingestion = IngestionConfig {
            duplicate_window: env.secs("COREJOBS_DUPLICATE_WINDOW_SECS", defaults.ingestion.duplicate_window)?,
        };

        let store = StoreConfig {
            backend: env.parse("COREJOBS_STORE", defaults.store.backend)?,
            database_url: env.get("DATABASE_URL"),
            max_connections: env.parse("COREJOBS_DB_MAX_CONNECTIONS", defaults.store.max_connections)?,
        };
        if store.backend == StoreBackend::Postgres && store.database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
                reason: "COREJOBS_STORE=postgres",
            });
        }

        let queue = QueueConfig {
            backend: env.parse("COREJOBS_QUEUE", defaults.queue.backend)?,
            redis_url: env.get("REDIS_URL").unwrap_or(defaults.queue.redis_url),
            stream_key: env.get("COREJOBS_QUEUE_STREAM").unwrap_or(defaults.queue.stream_key),
            group: env.get("COREJOBS_QUEUE_GROUP").unwrap_or(defaults.queue.group),
            visibility_timeout: env.secs("COREJOBS_VISIBILITY_TIMEOUT_SECS", defaults.queue.visibility_timeout)?,
        };
        if queue.visibility_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "COREJOBS_VISIBILITY_TIMEOUT_SECS",
                message: "must be at least 1".to_string(),
            });
        }

        let retry_defaults = defaults.worker.retry.clone();
        let retry = RetryPolicy {
            max_attempts: env.parse("COREJOBS_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: env.millis("COREJOBS_RETRY_BASE_MS", retry_defaults.base_delay)?,
            max_delay: env.millis("COREJOBS_RETRY_MAX_MS", retry_defaults.max_delay)?,
            strategy: env.parse("COREJOBS_RETRY_STRATEGY", retry_defaults.strategy)?,
            jitter: retry_defaults.jitter,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "COREJOBS_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }

        let worker = WorkerConfig {
            name: env.get("COREJOBS_WORKER_NAME").unwrap_or(defaults.worker.name),
            concurrency: env.parse("COREJOBS_WORKER_CONCURRENCY", defaults.worker.concurrency)?,
            poll_wait: env.millis("COREJOBS_POLL_WAIT_MS", defaults.worker.poll_wait)?,
            shutdown_grace: env.secs("COREJOBS_SHUTDOWN_GRACE_SECS", defaults.worker.shutdown_grace)?,
            retry,
        };
        if worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "COREJOBS_WORKER_CONCURRENCY",
                message: "must be at least 1".to_string(),
            });
        }

        let handlers = HandlersConfig {
            connection_test_delay: env.millis(
                "COREJOBS_CONNECTION_TEST_DELAY_MS",
                defaults.handlers.connection_test_delay,
            )?,
            import_batch_size: env.parse("COREJOBS_IMPORT_BATCH_SIZE", defaults.handlers.import_batch_size)?,
            import_file: env.get("COREJOBS_IMPORT_FILE").map(PathBuf::from),
        };
        if handlers.import_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "COREJOBS_IMPORT_BATCH_SIZE",
                message: "must be at least 1".to_string(),
            });
        }

        let http = HttpConfig {
            bind_addr: env.parse("COREJOBS_BIND_ADDR", defaults.http.bind_addr)?,
            embedded_workers: env.parse("COREJOBS_EMBEDDED_WORKERS", defaults.http.embedded_workers)?,
        };

        Ok(Self {
            log_format: env.parse("COREJOBS_LOG_FORMAT", defaults.log_format)?,
            http,
            pagination,
            ingestion,
            store,
            queue,
            worker,
            handlers,
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64).map(Duration::from_millis)
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.pagination.max_limit, 100);
        assert_eq!(cfg.worker.retry.max_attempts, 3);
        assert_eq!(cfg.queue.visibility_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = from_pairs(&[
            ("COREJOBS_PAGE_DEFAULT_LIMIT", "20"),
            ("COREJOBS_PAGE_MAX_LIMIT", "50"),
            ("COREJOBS_MAX_ATTEMPTS", "7"),
            ("COREJOBS_RETRY_STRATEGY", "linear"),
            ("COREJOBS_QUEUE", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("COREJOBS_LOG_FORMAT", "pretty"),
            ("COREJOBS_BIND_ADDR", "127.0.0.1:9000"),
        ])
        .unwrap();

        assert_eq!(cfg.pagination.default_limit, 20);
        assert_eq!(cfg.pagination.max_limit, 50);
        assert_eq!(cfg.worker.retry.max_attempts, 7);
        assert_eq!(cfg.worker.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(cfg.queue.backend, QueueBackend::Redis);
        assert_eq!(cfg.queue.redis_url, "redis://cache:6379");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.http.bind_addr.port(), 9000);
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = from_pairs(&[("COREJOBS_STORE", "postgres")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "DATABASE_URL", .. }));
    }

    #[test]
    fn rejects_default_limit_above_cap() {
        let err = from_pairs(&[("COREJOBS_PAGE_DEFAULT_LIMIT", "500")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COREJOBS_PAGE_DEFAULT_LIMIT", .. }));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = from_pairs(&[("COREJOBS_WORKER_CONCURRENCY", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COREJOBS_WORKER_CONCURRENCY", .. }));
    }
}
