//! Configuration for the sync engine.
//!
//! Durations are expressed in milliseconds when loaded from JSON
//! (`sync_interval_ms`, `request_timeout_ms`, ...).

use crate::error::{SyncError, SyncResult};
use driftsync_protocol::{PushRequest, TypeOrder};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between background cycles.
    #[serde(rename = "sync_interval_ms", with = "duration_ms")]
    pub sync_interval: Duration,
    /// Upper bound on the serialized size of one push request.
    pub max_payload_size: usize,
    /// Upper bound on the number of changes in one push request.
    pub max_batch_changes: usize,
    /// Changes requested per pull page.
    pub pull_page_size: u32,
    /// Pages fetched per cycle before the pull is cut short.
    pub max_pull_pages: u32,
    /// Deadline for each network call.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// How long acknowledged changes stay in the outbox for crash replay.
    #[serde(rename = "applied_retention_ms", with = "duration_ms")]
    pub applied_retention: Duration,
    /// Audit entries older than this are pruned after each cycle.
    #[serde(rename = "audit_retention_ms", with = "duration_ms")]
    pub audit_retention: Duration,
    /// Newest audit entries kept regardless of age.
    pub max_audit_entries: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Record types in transmission order, with their schemas.
    pub type_order: TypeOrder,
}

impl SyncConfig {
    /// Creates a configuration for the given type order with default limits.
    pub fn new(type_order: TypeOrder) -> Self {
        Self {
            type_order,
            ..Self::default()
        }
    }

    /// Parses a JSON configuration.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json(&json)
    }

    /// Sets the background cycle interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the push payload bound.
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Sets the per-request change count bound.
    pub fn with_max_batch_changes(mut self, count: usize) -> Self {
        self.max_batch_changes = count;
        self
    }

    /// Sets the audit log retention: entries older than `age` are dropped,
    /// and at most `max_entries` are kept.
    pub fn with_audit_retention(mut self, age: Duration, max_entries: usize) -> Self {
        self.audit_retention = age;
        self.max_audit_entries = max_entries;
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the per-cycle page bound.
    pub fn with_max_pull_pages(mut self, pages: u32) -> Self {
        self.max_pull_pages = pages;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long applied changes are retained.
    pub fn with_applied_retention(mut self, retention: Duration) -> Self {
        self.applied_retention = retention;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks limits once, at engine construction.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync_interval.is_zero() {
            return Err(SyncError::Config("sync_interval must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request_timeout must be positive".into()));
        }
        if self.pull_page_size == 0 {
            return Err(SyncError::Config("pull_page_size must be positive".into()));
        }
        if self.max_batch_changes == 0 {
            return Err(SyncError::Config("max_batch_changes must be positive".into()));
        }
        if self.max_pull_pages == 0 {
            return Err(SyncError::Config("max_pull_pages must be positive".into()));
        }
        if self.max_payload_size <= PushRequest::envelope_size() {
            return Err(SyncError::Config(format!(
                "max_payload_size must exceed the {} byte request envelope",
                PushRequest::envelope_size()
            )));
        }
        self.retry.validate()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            max_payload_size: 256 * 1024,
            max_batch_changes: 500,
            pull_page_size: 100,
            max_pull_pages: 50,
            request_timeout: Duration::from_secs(30),
            applied_retention: Duration::from_secs(24 * 60 * 60),
            audit_retention: Duration::from_secs(30 * 24 * 60 * 60),
            max_audit_entries: 10_000,
            retry: RetryConfig::default(),
            type_order: TypeOrder::default(),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which a change is abandoned.
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds.
    pub backoff_base: f64,
    /// Upper bound on the transient backoff.
    #[serde(rename = "backoff_max_ms", with = "duration_ms")]
    pub backoff_max: Duration,
    /// Fixed delay before re-pushing a dependency conflict.
    #[serde(rename = "dependency_retry_delay_ms", with = "duration_ms")]
    pub dependency_retry_delay: Duration,
    /// Whether to add up to 25% random jitter to transient delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Sets the backoff base.
    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    /// Sets the backoff cap.
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Sets the dependency retry delay.
    pub fn with_dependency_retry_delay(mut self, delay: Duration) -> Self {
        self.dependency_retry_delay = delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next transient retry, after `attempt` failures.
    ///
    /// `backoff_base ^ attempt` seconds plus up to 25% jitter when enabled,
    /// never more than `backoff_max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_secs = self.backoff_max.as_secs_f64();
        let mut delay_secs = self.backoff_base.powi(exponent).min(max_secs);

        if self.jitter {
            delay_secs += delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
        }
        Duration::from_secs_f64(delay_secs.min(max_secs))
    }

    /// Delay before re-pushing a dependency conflict. Independent of attempts.
    pub fn dependency_delay(&self) -> Duration {
        self.dependency_retry_delay
    }

    fn validate(&self) -> SyncResult<()> {
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be positive".into()));
        }
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(SyncError::Config("backoff_base must be at least 1.0".into()));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: 2.0,
            backoff_max: Duration::from_secs(300),
            dependency_retry_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::default()
            .with_pull_page_size(50)
            .with_max_pull_pages(4)
            .with_max_payload_size(4096)
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.pull_page_size, 50);
        assert_eq!(config.max_pull_pages, 4);
        assert_eq!(config.max_payload_size, 4096);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_limits() {
        assert!(SyncConfig::default().with_pull_page_size(0).validate().is_err());
        assert!(SyncConfig::default().with_max_payload_size(4).validate().is_err());
        assert!(SyncConfig::default().with_max_batch_changes(0).validate().is_err());
        assert!(SyncConfig::default()
            .with_retry(RetryConfig::default().with_backoff_base(0.5))
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_retry(RetryConfig::new(0))
            .validate()
            .is_err());
    }

    #[test]
    fn exponential_delay_without_jitter() {
        let config = RetryConfig::default()
            .with_jitter(false)
            .with_backoff_max(Duration::from_secs(10));

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default().with_backoff_max(Duration::from_secs(5));
        for attempt in 0..8 {
            let delay = config.delay_for_attempt(attempt);
            let base = 2f64.powi(attempt as i32).min(5.0);
            assert!(delay >= Duration::from_secs_f64(base));
            assert!(delay <= Duration::from_secs_f64((base * 1.25).min(5.0)));
        }
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let config = RetryConfig::default().with_backoff_max(Duration::from_secs(60));
        for _ in 0..200 {
            assert!(config.delay_for_attempt(20) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn dependency_delay_is_fixed() {
        let config = RetryConfig::default().with_dependency_retry_delay(Duration::from_secs(3));
        assert_eq!(config.dependency_delay(), Duration::from_secs(3));
    }

    #[test]
    fn loads_from_json() {
        let config = SyncConfig::from_json(
            r#"{
                "sync_interval_ms": 15000,
                "max_payload_size": 65536,
                "pull_page_size": 100,
                "retry": {"max_retries": 8, "dependency_retry_delay_ms": 2000},
                "type_order": [
                    {"record_type": "user", "required_fields": ["name"]},
                    {"record_type": "tally_session", "references": [
                        {"field": "user_id", "parent_type": "user"}
                    ]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.sync_interval, Duration::from_secs(15));
        assert_eq!(config.max_payload_size, 65536);
        assert_eq!(config.max_pull_pages, 50);
        assert_eq!(config.retry.max_retries, 8);
        assert_eq!(config.retry.dependency_retry_delay, Duration::from_secs(2));
        assert_eq!(config.retry.backoff_base, 2.0);
        assert_eq!(
            config.type_order.priority(&"tally_session".into()),
            Some(1)
        );
    }

    #[test]
    fn json_with_cyclic_order_fails() {
        let result = SyncConfig::from_json(
            r#"{"type_order": [
                {"record_type": "a", "references": [{"field": "b", "parent_type": "b"}]},
                {"record_type": "b"}
            ]}"#,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
