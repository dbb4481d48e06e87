// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Handle configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, ExpirationMode, Result, item::validate_expiration};

/// Settings shared by every handle implementation.
///
/// The configuration can be built in code or loaded from JSON; timeouts are
/// expressed in milliseconds in serialized form.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tierlink_handle::{ExpirationMode, HandleConfiguration};
///
/// let config = HandleConfiguration::new("memory")
///     .with_expiration(ExpirationMode::Sliding, Duration::from_secs(30))?
///     .with_statistics(true);
///
/// assert_eq!(config.name(), "memory");
/// assert!(config.enable_statistics());
/// # Ok::<(), tierlink_handle::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandleConfiguration {
    name: String,
    expiration_mode: ExpirationMode,
    #[serde(with = "duration_ms", rename = "expirationTimeoutMs")]
    expiration_timeout: Duration,
    enable_statistics: bool,
    is_backplane_source: bool,
}

impl Default for HandleConfiguration {
    fn default() -> Self {
        Self {
            name: String::new(),
            expiration_mode: ExpirationMode::None,
            expiration_timeout: Duration::ZERO,
            enable_statistics: false,
            is_backplane_source: false,
        }
    }
}

impl HandleConfiguration {
    /// Creates a configuration for a handle called `name` with no default expiration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the expiration applied to items that use defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument) if the pair
    /// violates the item expiration invariants.
    pub fn with_expiration(self, mode: ExpirationMode, timeout: Duration) -> Result<Self> {
        validate_expiration(mode, timeout)?;
        Ok(Self {
            expiration_mode: mode,
            expiration_timeout: timeout,
            ..self
        })
    }

    /// Enables or disables per-handle statistics.
    #[must_use]
    pub fn with_statistics(self, enabled: bool) -> Self {
        Self {
            enable_statistics: enabled,
            ..self
        }
    }

    /// Marks the handle as the one whose changes are published to the backplane.
    #[must_use]
    pub fn with_backplane_source(self, is_source: bool) -> Self {
        Self {
            is_backplane_source: is_source,
            ..self
        }
    }

    /// Returns the handle name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the default expiration mode.
    #[must_use]
    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration_mode
    }

    /// Returns the default expiration timeout.
    #[must_use]
    pub fn expiration_timeout(&self) -> Duration {
        self.expiration_timeout
    }

    /// Returns `true` if statistics are recorded.
    #[must_use]
    pub fn enable_statistics(&self) -> bool {
        self.enable_statistics
    }

    /// Returns `true` if this handle is the backplane source.
    #[must_use]
    pub fn is_backplane_source(&self) -> bool {
        self.is_backplane_source
    }

    /// Checks a configuration that may have been deserialized.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`](crate::ErrorKind::Configuration) if the name is empty
    /// or the expiration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("handle name must not be empty"));
        }

        validate_expiration(self.expiration_mode, self.expiration_timeout)
            .map_err(|e| Error::with_cause(crate::ErrorKind::Configuration, e))
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
///
/// Use with `#[serde(with = "tierlink_handle::duration_ms")]`.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes the duration as milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Reads a duration from milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn loads_from_json() {
        let config: HandleConfiguration = serde_json::from_str(
            r#"{ "name": "redis", "expirationMode": "Absolute", "expirationTimeoutMs": 1500, "isBackplaneSource": true }"#,
        )
        .unwrap();

        assert_eq!(config.name(), "redis");
        assert_eq!(config.expiration_mode(), ExpirationMode::Absolute);
        assert_eq!(config.expiration_timeout(), Duration::from_millis(1500));
        assert!(config.is_backplane_source());
        assert!(!config.enable_statistics());
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_invalid_settings() {
        assert_eq!(
            HandleConfiguration::default().validate().unwrap_err().kind(),
            ErrorKind::Configuration
        );

        let config: HandleConfiguration =
            serde_json::from_str(r#"{ "name": "x", "expirationMode": "Sliding", "expirationTimeoutMs": 0 }"#).unwrap();
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn with_expiration_validates() {
        let err = HandleConfiguration::new("x")
            .with_expiration(ExpirationMode::None, Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
