// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The immutable cache item model.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The longest expiration timeout an item may carry.
pub const MAX_EXPIRATION_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How an item expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpirationMode {
    /// Use the expiration configured on the handle that stores the item.
    #[default]
    Default,
    /// Never expire.
    None,
    /// Expire once the item has not been accessed for the timeout.
    Sliding,
    /// Expire once the timeout has elapsed since the item was created.
    Absolute,
}

impl ExpirationMode {
    /// Returns `true` for modes that carry a non-zero timeout.
    #[must_use]
    pub fn is_timed(self) -> bool {
        matches!(self, Self::Sliding | Self::Absolute)
    }
}

/// A cached value together with its key, region and expiration metadata.
///
/// Items are never changed in place. Every `with_*` method consumes the item
/// and returns a new one with the same key and region.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tierlink_handle::{CacheItem, ExpirationMode};
///
/// let item = CacheItem::new("user:1", "alice")?
///     .with_absolute_expiration(Duration::from_secs(60))?;
///
/// assert_eq!(item.key(), "user:1");
/// assert_eq!(item.expiration_mode(), ExpirationMode::Absolute);
/// assert!(!item.uses_expiration_defaults());
/// # Ok::<(), tierlink_handle::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheItem<V> {
    key: String,
    region: Option<String>,
    value: V,
    expiration_mode: ExpirationMode,
    expiration_timeout: Duration,
    created: Option<SystemTime>,
    last_accessed: Option<SystemTime>,
    uses_expiration_defaults: bool,
}

impl<V> CacheItem<V> {
    /// Creates an item without a region that follows the handle's default expiration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument) if the key is empty.
    pub fn new(key: impl Into<String>, value: V) -> Result<Self> {
        Self::build(key.into(), None, value)
    }

    /// Creates an item inside `region` that follows the handle's default expiration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument) if the key or
    /// the region is empty.
    pub fn in_region(key: impl Into<String>, region: impl Into<String>, value: V) -> Result<Self> {
        Self::build(key.into(), Some(region.into()), value)
    }

    fn build(key: String, region: Option<String>, value: V) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::invalid_argument("cache item key must not be empty"));
        }

        if region.as_deref().is_some_and(str::is_empty) {
            return Err(Error::invalid_argument("cache item region must not be empty when set"));
        }

        Ok(Self {
            key,
            region,
            value,
            expiration_mode: ExpirationMode::Default,
            expiration_timeout: Duration::ZERO,
            created: None,
            last_accessed: None,
            uses_expiration_defaults: true,
        })
    }

    /// Returns the item key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the item region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Returns a reference to the cached value.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the item and returns the inner value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns the name of the value type, used as the stored type tag.
    #[must_use]
    pub fn value_type(&self) -> &'static str {
        std::any::type_name::<V>()
    }

    /// Returns the expiration mode.
    #[must_use]
    pub fn expiration_mode(&self) -> ExpirationMode {
        self.expiration_mode
    }

    /// Returns the expiration timeout. Zero for [`ExpirationMode::None`] and [`ExpirationMode::Default`].
    #[must_use]
    pub fn expiration_timeout(&self) -> Duration {
        self.expiration_timeout
    }

    /// Returns when the item was first stored, if it has been stored.
    #[must_use]
    pub fn created(&self) -> Option<SystemTime> {
        self.created
    }

    /// Returns when the item was last read or written.
    #[must_use]
    pub fn last_accessed(&self) -> Option<SystemTime> {
        self.last_accessed
    }

    /// Returns `true` if the expiration comes from the storing handle's configuration.
    #[must_use]
    pub fn uses_expiration_defaults(&self) -> bool {
        self.uses_expiration_defaults
    }

    /// Returns a copy carrying `value` instead of the current value.
    #[must_use]
    pub fn with_value(self, value: V) -> Self {
        Self { value, ..self }
    }

    /// Returns a copy with an explicit expiration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument) if the timeout is
    /// zero for a timed mode, non-zero for an untimed mode, or longer than
    /// [`MAX_EXPIRATION_TIMEOUT`].
    pub fn with_expiration(self, mode: ExpirationMode, timeout: Duration) -> Result<Self> {
        validate_expiration(mode, timeout)?;
        Ok(Self {
            expiration_mode: mode,
            expiration_timeout: timeout,
            uses_expiration_defaults: false,
            ..self
        })
    }

    /// Returns a copy that expires `timeout` after creation.
    ///
    /// # Errors
    ///
    /// See [`CacheItem::with_expiration`].
    pub fn with_absolute_expiration(self, timeout: Duration) -> Result<Self> {
        self.with_expiration(ExpirationMode::Absolute, timeout)
    }

    /// Returns a copy that expires after `timeout` without access.
    ///
    /// # Errors
    ///
    /// See [`CacheItem::with_expiration`].
    pub fn with_sliding_expiration(self, timeout: Duration) -> Result<Self> {
        self.with_expiration(ExpirationMode::Sliding, timeout)
    }

    /// Returns a copy that never expires.
    #[must_use]
    pub fn with_no_expiration(self) -> Self {
        Self {
            expiration_mode: ExpirationMode::None,
            expiration_timeout: Duration::ZERO,
            uses_expiration_defaults: false,
            ..self
        }
    }

    /// Returns a copy that follows the storing handle's default expiration.
    #[must_use]
    pub fn with_default_expiration(self) -> Self {
        Self {
            expiration_mode: ExpirationMode::Default,
            expiration_timeout: Duration::ZERO,
            uses_expiration_defaults: true,
            ..self
        }
    }

    /// Returns a copy with the given creation time.
    ///
    /// The last-accessed time is set to the same instant when it is not yet known.
    #[must_use]
    pub fn with_created(self, created: SystemTime) -> Self {
        Self {
            created: Some(created),
            last_accessed: self.last_accessed.or(Some(created)),
            ..self
        }
    }

    /// Returns a copy stamped with `now` as creation time, unless it already has one.
    #[must_use]
    pub fn ensure_created(self, now: SystemTime) -> Self {
        if self.created.is_some() { self } else { self.with_created(now) }
    }

    /// Returns a copy whose last-accessed time is `now`.
    #[must_use]
    pub fn touched(self, now: SystemTime) -> Self {
        Self {
            last_accessed: Some(now),
            ..self
        }
    }

    /// Resolves [`ExpirationMode::Default`] against a handle's configured expiration.
    ///
    /// Items that carry an explicit expiration are returned unchanged. The
    /// uses-defaults flag stays set so that the next handle applies its own defaults.
    #[must_use]
    pub fn apply_defaults(self, mode: ExpirationMode, timeout: Duration) -> Self {
        if !self.uses_expiration_defaults && self.expiration_mode != ExpirationMode::Default {
            return self;
        }

        let (mode, timeout) = match mode {
            ExpirationMode::Default | ExpirationMode::None => (ExpirationMode::None, Duration::ZERO),
            timed => (timed, timeout),
        };

        Self {
            expiration_mode: mode,
            expiration_timeout: timeout,
            uses_expiration_defaults: true,
            ..self
        }
    }

    /// Returns `true` if the item has expired at `now`.
    ///
    /// Absolute items expire once `created + timeout` lies in the past, sliding
    /// items once `last_accessed + timeout` does. Items that were never stored do not expire.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        let anchor = match self.expiration_mode {
            ExpirationMode::Absolute => self.created,
            ExpirationMode::Sliding => self.last_accessed.or(self.created),
            ExpirationMode::Default | ExpirationMode::None => return false,
        };

        anchor
            .and_then(|anchor| anchor.checked_add(self.expiration_timeout))
            .is_some_and(|deadline| deadline < now)
    }

    /// Returns the time left before the item expires at `now`.
    ///
    /// `None` means the item does not expire.
    #[must_use]
    pub fn remaining_at(&self, now: SystemTime) -> Option<Duration> {
        let anchor = match self.expiration_mode {
            ExpirationMode::Absolute => self.created.unwrap_or(now),
            ExpirationMode::Sliding => self.last_accessed.or(self.created).unwrap_or(now),
            ExpirationMode::Default | ExpirationMode::None => return None,
        };

        let deadline = anchor.checked_add(self.expiration_timeout)?;
        Some(deadline.duration_since(now).unwrap_or(Duration::ZERO))
    }
}

/// Checks the timeout invariants for an expiration mode.
///
/// # Errors
///
/// Returns [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument) when the pair is invalid.
pub fn validate_expiration(mode: ExpirationMode, timeout: Duration) -> Result<()> {
    if timeout > MAX_EXPIRATION_TIMEOUT {
        return Err(Error::invalid_argument("expiration timeout must not exceed 365 days"));
    }

    match (mode.is_timed(), timeout.is_zero()) {
        (true, true) => Err(Error::invalid_argument(
            "absolute and sliding expiration require a timeout greater than zero",
        )),
        (false, false) => Err(Error::invalid_argument("expiration timeout must be zero without a timed mode")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn new_item_uses_defaults() {
        let item = CacheItem::new("k", 1).unwrap();
        assert_eq!(item.expiration_mode(), ExpirationMode::Default);
        assert_eq!(item.expiration_timeout(), Duration::ZERO);
        assert!(item.uses_expiration_defaults());
        assert!(item.created().is_none());
        assert!(item.region().is_none());
    }

    #[test]
    fn empty_key_or_region_is_rejected() {
        assert_eq!(CacheItem::new("", 1).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(CacheItem::in_region("k", "", 1).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn timeout_invariants() {
        let item = || CacheItem::new("k", 1).unwrap();

        assert!(item().with_absolute_expiration(Duration::ZERO).is_err());
        assert!(item().with_sliding_expiration(Duration::ZERO).is_err());
        assert!(item().with_expiration(ExpirationMode::None, Duration::from_secs(1)).is_err());
        assert!(item().with_expiration(ExpirationMode::Default, Duration::from_secs(1)).is_err());
        assert!(
            item()
                .with_absolute_expiration(MAX_EXPIRATION_TIMEOUT + Duration::from_secs(1))
                .is_err()
        );
        assert!(item().with_absolute_expiration(MAX_EXPIRATION_TIMEOUT).is_ok());
    }

    #[test]
    fn with_methods_keep_key_and_region() {
        let item = CacheItem::in_region("k", "r", 1)
            .unwrap()
            .with_value(2)
            .with_no_expiration()
            .with_created(at(10))
            .touched(at(20));

        assert_eq!(item.key(), "k");
        assert_eq!(item.region(), Some("r"));
        assert_eq!(*item.value(), 2);
        assert_eq!(item.created(), Some(at(10)));
        assert_eq!(item.last_accessed(), Some(at(20)));
        assert!(!item.uses_expiration_defaults());
    }

    #[test]
    fn absolute_expiry_counts_from_creation() {
        let item = CacheItem::new("k", 1)
            .unwrap()
            .with_absolute_expiration(Duration::from_secs(10))
            .unwrap()
            .with_created(at(100))
            .touched(at(109));

        assert!(!item.is_expired_at(at(110)));
        assert!(item.is_expired_at(at(111)));
    }

    #[test]
    fn sliding_expiry_counts_from_last_access() {
        let item = CacheItem::new("k", 1)
            .unwrap()
            .with_sliding_expiration(Duration::from_secs(10))
            .unwrap()
            .with_created(at(100))
            .touched(at(105));

        assert!(!item.is_expired_at(at(115)));
        assert!(item.is_expired_at(at(116)));
        assert_eq!(item.remaining_at(at(110)), Some(Duration::from_secs(5)));
    }

    #[test]
    fn untimed_items_never_expire() {
        let item = CacheItem::new("k", 1).unwrap().with_created(at(0));
        assert!(!item.is_expired_at(at(u64::from(u32::MAX))));
        assert_eq!(item.remaining_at(at(1)), None);
    }

    #[test]
    fn apply_defaults_only_touches_default_items() {
        let defaulted = CacheItem::new("k", 1)
            .unwrap()
            .apply_defaults(ExpirationMode::Sliding, Duration::from_secs(5));
        assert_eq!(defaulted.expiration_mode(), ExpirationMode::Sliding);
        assert_eq!(defaulted.expiration_timeout(), Duration::from_secs(5));
        assert!(defaulted.uses_expiration_defaults());

        let explicit = CacheItem::new("k", 1)
            .unwrap()
            .with_absolute_expiration(Duration::from_secs(1))
            .unwrap()
            .apply_defaults(ExpirationMode::Sliding, Duration::from_secs(5));
        assert_eq!(explicit.expiration_mode(), ExpirationMode::Absolute);

        let none = CacheItem::new("k", 1)
            .unwrap()
            .apply_defaults(ExpirationMode::Default, Duration::ZERO);
        assert_eq!(none.expiration_mode(), ExpirationMode::None);
    }

    #[test]
    fn ensure_created_keeps_existing_timestamp() {
        let item = CacheItem::new("k", 1).unwrap().ensure_created(at(1)).ensure_created(at(2));
        assert_eq!(item.created(), Some(at(1)));
    }

    #[test]
    fn value_type_names_the_value() {
        let item = CacheItem::new("k", String::new()).unwrap();
        assert!(item.value_type().ends_with("String"));
    }
}
