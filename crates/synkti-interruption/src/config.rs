//! Controller configuration
//!
//! [`ControllerArgs`] is the clap surface (flags plus `SYNKTI_*` environment
//! variables); [`ControllerSettings`] is the validated, immutable value the rest of
//! the crate is built from.

use crate::cache::{DEFAULT_CACHE_CLEANUP_INTERVAL_SECS, DEFAULT_UNAVAILABLE_OFFERINGS_TTL_SECS};
use crate::dispatch::{DEFAULT_MAINTENANCE_DRAIN_GRACE_SECS, DEFAULT_SPOT_DRAIN_GRACE_SECS};
use crate::error::{InterruptionError, Result};
use crate::retry::{DEFAULT_RETRY_MAX_ATTEMPTS, RetryConfig};
use std::time::Duration;

/// SQS bounds on `MaxNumberOfMessages`
pub const MAX_BATCH_SIZE: i32 = 10;
/// SQS bounds on `WaitTimeSeconds`
pub const MAX_WAIT_SECS: u64 = 20;
/// SQS bounds on `MessageRetentionPeriod`
pub const MIN_MESSAGE_RETENTION_SECS: u64 = 60;
/// SQS bounds on `MessageRetentionPeriod` (14 days)
pub const MAX_MESSAGE_RETENTION_SECS: u64 = 1_209_600;

/// Default `MessageRetentionPeriod` (5 minutes)
pub const DEFAULT_MESSAGE_RETENTION_SECS: u64 = 300;
/// Default number of concurrent message workers
pub const DEFAULT_WORKERS: usize = 20;
/// Default pause between ticks
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Default deliveries after which a failing message is dropped anyway
pub const DEFAULT_MAX_RECEIVE_ATTEMPTS: u32 = 5;
/// Default interval between infrastructure resyncs
pub const DEFAULT_INFRA_RESYNC_SECS: u64 = 300;
/// Default receive count before SQS moves a message to the dead-letter queue
pub const DEFAULT_DEAD_LETTER_MAX_RECEIVES: u32 = 5;
/// Default cap on receives per tick while batches keep coming back full
pub const DEFAULT_MAX_BATCHES_PER_TICK: usize = 10;

/// Validated controller settings
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Cluster identity; all owned cloud resources derive their names from it
    pub cluster_name: String,
    /// AWS region override (falls back to the SDK's region chain)
    pub region: Option<String>,
    /// Feature flag: when off, `run` returns immediately
    pub interruption_handling: bool,
    /// Explicit queue name instead of the cluster-derived one
    pub queue_name: Option<String>,
    /// Queue `MessageRetentionPeriod`
    pub message_retention: Duration,
    /// Dead-letter queue ARN for the redrive policy
    pub dead_letter_queue_arn: Option<String>,
    /// `maxReceiveCount` of the redrive policy
    pub dead_letter_max_receives: u32,
    /// Messages requested per receive (1..=10)
    pub batch_size: i32,
    /// Long-poll wait per receive (0..=20s)
    pub wait: Duration,
    /// Pause between ticks
    pub poll_interval: Duration,
    /// Receives per tick while the queue keeps returning full batches
    pub max_batches_per_tick: usize,
    /// Concurrent message workers per tick
    pub workers: usize,
    /// TTL of unavailable-offering entries
    pub cache_ttl: Duration,
    /// Interval of the cache sweep
    pub cache_cleanup_interval: Duration,
    /// Deliveries after which a transiently failing message is deleted anyway
    pub max_receive_attempts: u32,
    /// Drain grace for spot interruptions
    pub spot_drain_grace: Duration,
    /// Drain grace for scheduled maintenance
    pub maintenance_drain_grace: Duration,
    /// Backoff for queue and node operations
    pub retry: RetryConfig,
    /// Whether the controller creates and repairs its queue and rules
    pub manage_infrastructure: bool,
    /// Interval between infrastructure resyncs
    pub infra_resync: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cluster_name: "synkti".to_string(),
            region: None,
            interruption_handling: true,
            queue_name: None,
            message_retention: Duration::from_secs(DEFAULT_MESSAGE_RETENTION_SECS),
            dead_letter_queue_arn: None,
            dead_letter_max_receives: DEFAULT_DEAD_LETTER_MAX_RECEIVES,
            batch_size: MAX_BATCH_SIZE,
            wait: Duration::from_secs(MAX_WAIT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_batches_per_tick: DEFAULT_MAX_BATCHES_PER_TICK,
            workers: DEFAULT_WORKERS,
            cache_ttl: Duration::from_secs(DEFAULT_UNAVAILABLE_OFFERINGS_TTL_SECS),
            cache_cleanup_interval: Duration::from_secs(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS),
            max_receive_attempts: DEFAULT_MAX_RECEIVE_ATTEMPTS,
            spot_drain_grace: Duration::from_secs(DEFAULT_SPOT_DRAIN_GRACE_SECS),
            maintenance_drain_grace: Duration::from_secs(DEFAULT_MAINTENANCE_DRAIN_GRACE_SECS),
            retry: RetryConfig::default(),
            manage_infrastructure: true,
            infra_resync: Duration::from_secs(DEFAULT_INFRA_RESYNC_SECS),
        }
    }
}

impl ControllerSettings {
    /// Default settings for a cluster
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// Set the queue name override
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the long-poll wait
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Set the pause between ticks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the receive cap per tick
    pub fn with_max_batches_per_tick(mut self, batches: usize) -> Self {
        self.max_batches_per_tick = batches;
        self
    }

    /// Set the worker fan-out
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the message retention period
    pub fn with_message_retention(mut self, retention: Duration) -> Self {
        self.message_retention = retention;
        self
    }

    /// Configure a dead-letter queue
    pub fn with_dead_letter_queue(mut self, arn: impl Into<String>, max_receives: u32) -> Self {
        self.dead_letter_queue_arn = Some(arn.into());
        self.dead_letter_max_receives = max_receives;
        self
    }

    /// Set the unavailable-offerings TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the delivery count after which failing messages are dropped
    pub fn with_max_receive_attempts(mut self, attempts: u32) -> Self {
        self.max_receive_attempts = attempts;
        self
    }

    /// Set the backoff policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Toggle infrastructure management
    pub fn with_manage_infrastructure(mut self, manage: bool) -> Self {
        self.manage_infrastructure = manage;
        self
    }

    /// Toggle the interruption-handling feature flag
    pub fn with_interruption_handling(mut self, enabled: bool) -> Self {
        self.interruption_handling = enabled;
        self
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(InterruptionError::config("cluster name must not be empty"));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(InterruptionError::config(format!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.wait > Duration::from_secs(MAX_WAIT_SECS) {
            return Err(InterruptionError::config(format!(
                "wait must be at most {MAX_WAIT_SECS}s, got {:?}",
                self.wait
            )));
        }
        let retention = self.message_retention.as_secs();
        if !(MIN_MESSAGE_RETENTION_SECS..=MAX_MESSAGE_RETENTION_SECS).contains(&retention) {
            return Err(InterruptionError::config(format!(
                "message retention must be between {MIN_MESSAGE_RETENTION_SECS}s and {MAX_MESSAGE_RETENTION_SECS}s, got {retention}s"
            )));
        }
        if self.workers == 0 {
            return Err(InterruptionError::config("workers must be at least 1"));
        }
        if self.max_batches_per_tick == 0 {
            return Err(InterruptionError::config("max batches per tick must be at least 1"));
        }
        if self.max_receive_attempts == 0 {
            return Err(InterruptionError::config("max receive attempts must be at least 1"));
        }
        if self.cache_ttl.is_zero() {
            return Err(InterruptionError::config("cache TTL must be positive"));
        }
        if self.cache_cleanup_interval.is_zero() || self.infra_resync.is_zero() {
            return Err(InterruptionError::config("intervals must be positive"));
        }
        if self.dead_letter_queue_arn.is_some() && !(1..=1000).contains(&self.dead_letter_max_receives) {
            return Err(InterruptionError::config(format!(
                "dead-letter max receives must be between 1 and 1000, got {}",
                self.dead_letter_max_receives
            )));
        }
        if let Some(name) = &self.queue_name {
            if name.is_empty() || name.len() > 80 {
                return Err(InterruptionError::config("queue name must be 1-80 characters"));
            }
        }
        Ok(())
    }
}

/// Command-line options of the controller
#[derive(clap::Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Cluster name (namespaces the queue and rules)
    #[arg(long, env = "SYNKTI_CLUSTER_NAME")]
    pub cluster_name: String,

    /// AWS region (defaults to the SDK region chain)
    #[arg(long, env = "SYNKTI_REGION")]
    pub region: Option<String>,

    /// Enable interruption handling
    #[arg(long, env = "SYNKTI_INTERRUPTION_HANDLING", default_value_t = true, action = clap::ArgAction::Set)]
    pub interruption_handling: bool,

    /// Queue name (default: derived from the cluster name)
    #[arg(long, env = "SYNKTI_QUEUE_NAME")]
    pub queue_name: Option<String>,

    /// Queue message retention (seconds)
    #[arg(long, env = "SYNKTI_MESSAGE_RETENTION_SECS", default_value_t = DEFAULT_MESSAGE_RETENTION_SECS)]
    pub message_retention_secs: u64,

    /// Dead-letter queue ARN
    #[arg(long, env = "SYNKTI_DEAD_LETTER_QUEUE_ARN")]
    pub dead_letter_queue_arn: Option<String>,

    /// Receives before a message moves to the dead-letter queue
    #[arg(long, env = "SYNKTI_DEAD_LETTER_MAX_RECEIVES", default_value_t = DEFAULT_DEAD_LETTER_MAX_RECEIVES)]
    pub dead_letter_max_receives: u32,

    /// Messages per receive (1-10)
    #[arg(long, env = "SYNKTI_BATCH_SIZE", default_value_t = MAX_BATCH_SIZE)]
    pub batch_size: i32,

    /// Long-poll wait per receive (seconds, 0-20)
    #[arg(long, env = "SYNKTI_WAIT_SECS", default_value_t = MAX_WAIT_SECS)]
    pub wait_secs: u64,

    /// Pause between ticks (milliseconds)
    #[arg(long, env = "SYNKTI_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Receives per tick while batches come back full
    #[arg(long, env = "SYNKTI_MAX_BATCHES_PER_TICK", default_value_t = DEFAULT_MAX_BATCHES_PER_TICK)]
    pub max_batches_per_tick: usize,

    /// Concurrent message workers
    #[arg(long, env = "SYNKTI_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Unavailable-offerings TTL (seconds)
    #[arg(long, env = "SYNKTI_CACHE_TTL_SECS", default_value_t = DEFAULT_UNAVAILABLE_OFFERINGS_TTL_SECS)]
    pub cache_ttl_secs: u64,

    /// Unavailable-offerings sweep interval (seconds)
    #[arg(long, env = "SYNKTI_CACHE_CLEANUP_SECS", default_value_t = DEFAULT_CACHE_CLEANUP_INTERVAL_SECS)]
    pub cache_cleanup_secs: u64,

    /// Deliveries after which a failing message is deleted anyway
    #[arg(long, env = "SYNKTI_MAX_RECEIVE_ATTEMPTS", default_value_t = DEFAULT_MAX_RECEIVE_ATTEMPTS)]
    pub max_receive_attempts: u32,

    /// Drain grace for spot interruptions (seconds)
    #[arg(long, env = "SYNKTI_SPOT_DRAIN_GRACE_SECS", default_value_t = DEFAULT_SPOT_DRAIN_GRACE_SECS)]
    pub spot_drain_grace_secs: u64,

    /// Drain grace for scheduled maintenance (seconds)
    #[arg(long, env = "SYNKTI_MAINTENANCE_DRAIN_GRACE_SECS", default_value_t = DEFAULT_MAINTENANCE_DRAIN_GRACE_SECS)]
    pub maintenance_drain_grace_secs: u64,

    /// Attempts per queue/node operation
    #[arg(long, env = "SYNKTI_RETRY_MAX_ATTEMPTS", default_value_t = DEFAULT_RETRY_MAX_ATTEMPTS)]
    pub retry_max_attempts: u32,

    /// Create and repair the queue and rules
    #[arg(long, env = "SYNKTI_MANAGE_INFRASTRUCTURE", default_value_t = true, action = clap::ArgAction::Set)]
    pub manage_infrastructure: bool,

    /// Infrastructure resync interval (seconds)
    #[arg(long, env = "SYNKTI_INFRA_RESYNC_SECS", default_value_t = DEFAULT_INFRA_RESYNC_SECS)]
    pub infra_resync_secs: u64,
}

impl ControllerArgs {
    /// Convert into validated settings
    pub fn into_settings(self) -> Result<ControllerSettings> {
        let settings = ControllerSettings {
            cluster_name: self.cluster_name,
            region: self.region,
            interruption_handling: self.interruption_handling,
            queue_name: self.queue_name,
            message_retention: Duration::from_secs(self.message_retention_secs),
            dead_letter_queue_arn: self.dead_letter_queue_arn,
            dead_letter_max_receives: self.dead_letter_max_receives,
            batch_size: self.batch_size,
            wait: Duration::from_secs(self.wait_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_batches_per_tick: self.max_batches_per_tick,
            workers: self.workers,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            cache_cleanup_interval: Duration::from_secs(self.cache_cleanup_secs),
            max_receive_attempts: self.max_receive_attempts,
            spot_drain_grace: Duration::from_secs(self.spot_drain_grace_secs),
            maintenance_drain_grace: Duration::from_secs(self.maintenance_drain_grace_secs),
            retry: RetryConfig::with_max_attempts(self.retry_max_attempts),
            manage_infrastructure: self.manage_infrastructure,
            infra_resync: Duration::from_secs(self.infra_resync_secs),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ControllerArgs,
    }

    fn parse(args: &[&str]) -> Result<ControllerSettings> {
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv)
            .map_err(|e| InterruptionError::config(e.to_string()))?
            .args
            .into_settings()
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = ControllerSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.wait, Duration::from_secs(20));
        assert_eq!(settings.workers, 20);
        assert_eq!(settings.message_retention, Duration::from_secs(300));
        assert!(settings.interruption_handling);
    }

    #[test]
    fn test_cli_defaults_match_settings_defaults() {
        let parsed = parse(&["--cluster-name", "prod"]).unwrap();
        let defaults = ControllerSettings::new("prod");
        assert_eq!(parsed.cluster_name, "prod");
        assert_eq!(parsed.batch_size, defaults.batch_size);
        assert_eq!(parsed.wait, defaults.wait);
        assert_eq!(parsed.max_batches_per_tick, defaults.max_batches_per_tick);
        assert_eq!(parsed.cache_ttl, defaults.cache_ttl);
        assert_eq!(parsed.spot_drain_grace, defaults.spot_drain_grace);
        assert_eq!(parsed.retry.max_attempts, defaults.retry.max_attempts);
        assert_eq!(parsed.manage_infrastructure, defaults.manage_infrastructure);
    }

    #[test]
    fn test_cli_overrides() {
        let parsed = parse(&[
            "--cluster-name",
            "prod",
            "--batch-size",
            "5",
            "--wait-secs",
            "0",
            "--interruption-handling",
            "false",
            "--dead-letter-queue-arn",
            "arn:aws:sqs:us-east-1:123456789012:dlq",
        ])
        .unwrap();
        assert_eq!(parsed.batch_size, 5);
        assert_eq!(parsed.wait, Duration::ZERO);
        assert!(!parsed.interruption_handling);
        assert_eq!(
            parsed.dead_letter_queue_arn.as_deref(),
            Some("arn:aws:sqs:us-east-1:123456789012:dlq")
        );
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(ControllerSettings::default().with_batch_size(0).validate().is_err());
        assert!(ControllerSettings::default().with_batch_size(11).validate().is_err());
        assert!(ControllerSettings::default().with_wait(Duration::from_secs(21)).validate().is_err());
        assert!(ControllerSettings::default().with_workers(0).validate().is_err());
        assert!(ControllerSettings::default().with_max_batches_per_tick(0).validate().is_err());
        assert!(ControllerSettings::default()
            .with_message_retention(Duration::from_secs(30))
            .validate()
            .is_err());
        assert!(ControllerSettings::new("  ").validate().is_err());
        assert!(parse(&["--cluster-name", "prod", "--batch-size", "20"]).is_err());
    }
}
