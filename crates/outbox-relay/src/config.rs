//! Relay configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::health::HealthThresholds;
use crate::retry::RetryPolicy;

/// Cadence of the processor runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingConfig {
    /// When `false`, [`ProcessorRuntime::run`](crate::ProcessorRuntime::run)
    /// returns immediately. Default: `true`.
    pub enabled: bool,

    /// Pause between the end of one run and the start of the next.
    /// Default: 2 seconds.
    pub fixed_delay: Duration,

    /// Number of independent processor loops. They coordinate only through
    /// the store's claim. Default: 1.
    pub workers: usize,

    /// Maximum time to wait for in-flight runs during shutdown.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fixed_delay: Duration::from_secs(2),
            workers: 1,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the outbox processor, its scheduler, and health checks.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use outbox_relay::{OutboxConfig, RetryPolicy};
///
/// let config = OutboxConfig {
///     batch_size: 50,
///     retry: RetryPolicy {
///         max_attempts: 8,
///         ..Default::default()
///     },
///     publish_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert_eq!(config.run_timeout, Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Maximum messages claimed per run. Default: 100.
    pub batch_size: usize,

    /// Backoff and dead-letter policy.
    pub retry: RetryPolicy,

    /// Upper bound on a single publish call. Default: 30 seconds.
    pub publish_timeout: Duration,

    /// Overall budget for one run. Messages still unpublished when it runs
    /// out are recorded as failed attempts. Default: 60 seconds.
    pub run_timeout: Duration,

    /// How long a message may sit in `PROCESSING` before a run releases it
    /// back to `PENDING`. Must exceed `run_timeout + publish_timeout`, or a
    /// claim still being published could be handed to another processor;
    /// [`OutboxConfig::normalized`] raises it otherwise. Default: 5 minutes.
    pub processing_timeout: Duration,

    /// Publishes in flight at once within a run. Default: 1 (sequential).
    pub concurrency: usize,

    /// Identifies this processor in logs. Generated when `None`.
    pub worker_id: Option<String>,

    pub scheduling: SchedulingConfig,

    pub health: HealthThresholds,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry: RetryPolicy::default(),
            publish_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(300),
            concurrency: 1,
            worker_id: None,
            scheduling: SchedulingConfig::default(),
            health: HealthThresholds::default(),
        }
    }
}

impl OutboxConfig {
    /// Load from `OUTBOX_*` environment variables, reading `.env` first.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OUTBOX_BATCH_SIZE` | `batch_size` |
    /// | `OUTBOX_MAX_ATTEMPTS` | `retry.max_attempts` |
    /// | `OUTBOX_INITIAL_BACKOFF_MS` | `retry.initial_backoff` |
    /// | `OUTBOX_MAX_BACKOFF_MS` | `retry.max_backoff` |
    /// | `OUTBOX_BACKOFF_MULTIPLIER` | `retry.multiplier` |
    /// | `OUTBOX_PUBLISH_TIMEOUT_MS` | `publish_timeout` |
    /// | `OUTBOX_RUN_TIMEOUT_MS` | `run_timeout` |
    /// | `OUTBOX_PROCESSING_TIMEOUT_MS` | `processing_timeout` |
    /// | `OUTBOX_CONCURRENCY` | `concurrency` |
    /// | `OUTBOX_WORKER_ID` | `worker_id` |
    /// | `OUTBOX_SCHEDULING_ENABLED` | `scheduling.enabled` |
    /// | `OUTBOX_FIXED_DELAY_MS` | `scheduling.fixed_delay` |
    /// | `OUTBOX_WORKERS` | `scheduling.workers` |
    /// | `OUTBOX_SHUTDOWN_TIMEOUT_MS` | `scheduling.shutdown_timeout` |
    /// | `OUTBOX_HEALTH_WARNING_THRESHOLD` | `health.warning_threshold` |
    /// | `OUTBOX_HEALTH_ERROR_THRESHOLD` | `health.error_threshold` |
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        env.set("OUTBOX_BATCH_SIZE", &mut config.batch_size);
        env.set("OUTBOX_MAX_ATTEMPTS", &mut config.retry.max_attempts);
        env.set_millis("OUTBOX_INITIAL_BACKOFF_MS", &mut config.retry.initial_backoff);
        env.set_millis("OUTBOX_MAX_BACKOFF_MS", &mut config.retry.max_backoff);
        env.set("OUTBOX_BACKOFF_MULTIPLIER", &mut config.retry.multiplier);
        env.set_millis("OUTBOX_PUBLISH_TIMEOUT_MS", &mut config.publish_timeout);
        env.set_millis("OUTBOX_RUN_TIMEOUT_MS", &mut config.run_timeout);
        env.set_millis("OUTBOX_PROCESSING_TIMEOUT_MS", &mut config.processing_timeout);
        env.set("OUTBOX_CONCURRENCY", &mut config.concurrency);
        if let Some(worker_id) = (env.lookup)("OUTBOX_WORKER_ID") {
            config.worker_id = Some(worker_id);
        }
        env.set("OUTBOX_SCHEDULING_ENABLED", &mut config.scheduling.enabled);
        env.set_millis("OUTBOX_FIXED_DELAY_MS", &mut config.scheduling.fixed_delay);
        env.set("OUTBOX_WORKERS", &mut config.scheduling.workers);
        env.set_millis(
            "OUTBOX_SHUTDOWN_TIMEOUT_MS",
            &mut config.scheduling.shutdown_timeout,
        );
        env.set(
            "OUTBOX_HEALTH_WARNING_THRESHOLD",
            &mut config.health.warning_threshold,
        );
        env.set(
            "OUTBOX_HEALTH_ERROR_THRESHOLD",
            &mut config.health.error_threshold,
        );

        config.normalized()
    }

    /// Replace invalid values with defaults instead of failing.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let mut config = self;

        config.retry = config.retry.normalized();
        config.health = config.health.normalized();

        if config.batch_size == 0 {
            warn!("batch_size is 0, using {}", defaults.batch_size);
            config.batch_size = defaults.batch_size;
        }
        if config.concurrency == 0 {
            warn!("concurrency is 0, using {}", defaults.concurrency);
            config.concurrency = defaults.concurrency;
        }
        if config.scheduling.workers == 0 {
            warn!("scheduling.workers is 0, using {}", defaults.scheduling.workers);
            config.scheduling.workers = defaults.scheduling.workers;
        }
        for (name, value, default) in [
            ("publish_timeout", &mut config.publish_timeout, defaults.publish_timeout),
            ("run_timeout", &mut config.run_timeout, defaults.run_timeout),
            (
                "processing_timeout",
                &mut config.processing_timeout,
                defaults.processing_timeout,
            ),
            (
                "scheduling.fixed_delay",
                &mut config.scheduling.fixed_delay,
                defaults.scheduling.fixed_delay,
            ),
            (
                "scheduling.shutdown_timeout",
                &mut config.scheduling.shutdown_timeout,
                defaults.scheduling.shutdown_timeout,
            ),
        ] {
            if value.is_zero() {
                warn!("{name} is 0, using {default:?}");
                *value = default;
            }
        }

        let in_use = config.run_timeout.saturating_add(config.publish_timeout);
        if config.processing_timeout <= in_use {
            let raised = defaults.processing_timeout.max(in_use.saturating_mul(2));
            warn!(
                processing_timeout = ?config.processing_timeout,
                run_timeout = ?config.run_timeout,
                publish_timeout = ?config.publish_timeout,
                "processing_timeout must exceed run_timeout + publish_timeout, using {raised:?}"
            );
            config.processing_timeout = raised;
        }

        config
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn set<T: FromStr>(&self, key: &str, target: &mut T) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable outbox setting"),
        }
    }

    fn set_millis(&self, key: &str, target: &mut Duration) {
        let mut millis = target.as_millis() as u64;
        self.set(key, &mut millis);
        *target = Duration::from_millis(millis);
    }
}
