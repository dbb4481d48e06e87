// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Redis handle and backplane configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tierlink_handle::{Error, Result, duration_ms};

/// Default pub/sub channel used by the backplane.
pub const DEFAULT_CHANNEL: &str = "CacheManagerBackplane";

/// Connection and behavior settings for [`RedisCacheHandle`](crate::RedisCacheHandle).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tierlink_redis::RedisConfiguration;
///
/// let config = RedisConfiguration::new("redis://127.0.0.1:6379")
///     .with_database(2)
///     .with_key_prefix("app:")
///     .with_retry(5, Duration::from_millis(50));
///
/// assert_eq!(config.database(), 2);
/// assert!(config.use_scripting());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfiguration {
    connection_string: String,
    database: u32,
    key_prefix: Option<String>,
    use_scripting: bool,
    keyspace_notifications: bool,
    retry_count: u32,
    #[serde(with = "duration_ms", rename = "retryTimeoutMs")]
    retry_timeout: Duration,
}

impl Default for RedisConfiguration {
    fn default() -> Self {
        Self {
            connection_string: "redis://127.0.0.1:6379".to_owned(),
            database: 0,
            key_prefix: None,
            use_scripting: true,
            keyspace_notifications: false,
            retry_count: 3,
            retry_timeout: Duration::from_millis(100),
        }
    }
}

impl RedisConfiguration {
    /// Creates a configuration for the given connection string.
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Selects the logical database.
    #[must_use]
    pub fn with_database(self, database: u32) -> Self {
        Self { database, ..self }
    }

    /// Prefixes every stored key.
    #[must_use]
    pub fn with_key_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: Some(prefix.into()),
            ..self
        }
    }

    /// Enables or disables server-side Lua scripts.
    ///
    /// Disable scripting for proxies that do not forward `EVALSHA`.
    #[must_use]
    pub fn with_scripting(self, enabled: bool) -> Self {
        Self {
            use_scripting: enabled,
            ..self
        }
    }

    /// Enables or disables keyspace notifications for expired, evicted and deleted keys.
    #[must_use]
    pub fn with_keyspace_notifications(self, enabled: bool) -> Self {
        Self {
            keyspace_notifications: enabled,
            ..self
        }
    }

    /// Sets how often a transient failure is retried and how long to wait between attempts.
    #[must_use]
    pub fn with_retry(self, retry_count: u32, retry_timeout: Duration) -> Self {
        Self {
            retry_count,
            retry_timeout,
            ..self
        }
    }

    /// Returns the connection string.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Returns the logical database.
    #[must_use]
    pub fn database(&self) -> u32 {
        self.database
    }

    /// Returns the key prefix, if any.
    #[must_use]
    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    /// Returns `true` if Lua scripts are used.
    #[must_use]
    pub fn use_scripting(&self) -> bool {
        self.use_scripting
    }

    /// Returns `true` if keyspace notifications are consumed.
    #[must_use]
    pub fn keyspace_notifications(&self) -> bool {
        self.keyspace_notifications
    }

    /// Returns how often a transient failure is retried.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns the delay between transient retries.
    #[must_use]
    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.connection_string.is_empty() {
            return Err(Error::configuration("redis connection string must not be empty"));
        }
        Ok(())
    }
}

/// Settings for [`RedisCacheBackplane`](crate::RedisCacheBackplane).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackplaneConfiguration {
    channel_name: String,
    capacity: usize,
    #[serde(with = "duration_ms", rename = "debounceMs")]
    debounce: Duration,
    #[serde(with = "duration_ms", rename = "flushIntervalMs")]
    flush_interval: Duration,
}

impl Default for BackplaneConfiguration {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL.to_owned(),
            capacity: 50_000,
            debounce: Duration::from_millis(10),
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl BackplaneConfiguration {
    /// Sets the pub/sub channel.
    #[must_use]
    pub fn with_channel_name(self, channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..self
        }
    }

    /// Sets how many distinct messages may wait for the next flush.
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Sets the delay between the first queued message and the flush it triggers.
    #[must_use]
    pub fn with_debounce(self, debounce: Duration) -> Self {
        Self { debounce, ..self }
    }

    /// Sets the period of the safety flush.
    #[must_use]
    pub fn with_flush_interval(self, flush_interval: Duration) -> Self {
        Self { flush_interval, ..self }
    }

    /// Returns the pub/sub channel.
    #[must_use]
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Returns the pending buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the debounce delay.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Returns the safety flush period.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(Error::configuration("backplane channel name must not be empty"));
        }
        if self.capacity == 0 {
            return Err(Error::configuration("backplane capacity must be greater than zero"));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::configuration("backplane flush interval must be greater than zero"));
        }
        Ok(())
    }
}
