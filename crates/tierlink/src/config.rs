// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tierlink_handle::{Error, Result, duration_ms};

/// How the manager spreads changes between its own handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Handles are only touched by the operation that targets them.
    None,
    /// Removals reported by a handle evict nearer handles, and updated items
    /// are pushed to handles after the source.
    #[default]
    PropagateUpward,
}

/// Settings of a [`CacheManager`](crate::CacheManager).
///
/// # Examples
///
/// ```
/// use tierlink::{ManagerConfiguration, UpdateMode};
///
/// let config: ManagerConfiguration =
///     serde_json::from_str(r#"{ "name": "orders", "maxRetries": 10, "updateMode": "None" }"#)?;
///
/// assert_eq!(config.name(), "orders");
/// assert_eq!(config.max_retries(), 10);
/// assert_eq!(config.update_mode(), UpdateMode::None);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfiguration {
    name: String,
    max_retries: u32,
    #[serde(with = "duration_ms", rename = "retryTimeoutMs")]
    retry_timeout: Duration,
    update_mode: UpdateMode,
}

impl Default for ManagerConfiguration {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_retries: 50,
            retry_timeout: Duration::from_millis(100),
            update_mode: UpdateMode::PropagateUpward,
        }
    }
}

impl ManagerConfiguration {
    /// Creates a configuration with default settings for a manager called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the attempt budget of `get_or_add` and the default budget of `add_or_update`.
    #[must_use]
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    /// Sets how long a failed eviction waits before its single retry.
    #[must_use]
    pub fn with_retry_timeout(self, retry_timeout: Duration) -> Self {
        Self { retry_timeout, ..self }
    }

    /// Sets the update propagation mode.
    #[must_use]
    pub fn with_update_mode(self, update_mode: UpdateMode) -> Self {
        Self { update_mode, ..self }
    }

    /// Returns the manager name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the delay before a failed eviction is retried.
    #[must_use]
    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    /// Returns the update propagation mode.
    #[must_use]
    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("manager name must not be empty"));
        }
        if self.max_retries == 0 {
            return Err(Error::configuration("max_retries must be greater than zero"));
        }
        Ok(())
    }
}
