// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Redis hash layout of a stored item.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, de::DeserializeOwned};
use tierlink_handle::{CacheItem, Error, ErrorKind, ExpirationMode, Result};

pub(crate) const FIELD_VALUE: &str = "value";
pub(crate) const FIELD_TYPE: &str = "type";
pub(crate) const FIELD_EXPIRATION: &str = "expiration";
pub(crate) const FIELD_TIMEOUT: &str = "timeout";
pub(crate) const FIELD_CREATED: &str = "created";
pub(crate) const FIELD_VERSION: &str = "version";
pub(crate) const FIELD_DEFAULT_EXPIRATION: &str = "defaultExpiration";

/// Sentinel stored against each member of a region lookup hash.
pub(crate) const REGION_SENTINEL: &str = "regionKey";

/// Field order returned by the get script and the fallback `HMGET`.
pub(crate) const READ_FIELDS: [&str; 7] = [
    FIELD_VALUE,
    FIELD_EXPIRATION,
    FIELD_TIMEOUT,
    FIELD_CREATED,
    FIELD_VERSION,
    FIELD_DEFAULT_EXPIRATION,
    FIELD_TYPE,
];

/// 100ns ticks between 0001-01-01 and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

pub(crate) fn expiration_code(mode: ExpirationMode) -> u8 {
    match mode {
        ExpirationMode::Default => 0,
        ExpirationMode::None => 1,
        ExpirationMode::Sliding => 2,
        ExpirationMode::Absolute => 3,
    }
}

pub(crate) fn expiration_from_code(code: u8) -> Option<ExpirationMode> {
    match code {
        0 => Some(ExpirationMode::Default),
        1 => Some(ExpirationMode::None),
        2 => Some(ExpirationMode::Sliding),
        3 => Some(ExpirationMode::Absolute),
        _ => None,
    }
}

/// Converts a timestamp into 100ns ticks since 0001-01-01.
pub(crate) fn to_ticks(time: SystemTime) -> i64 {
    let since_epoch = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos() / 100).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos() / 100).unwrap_or(i64::MAX),
    };
    UNIX_EPOCH_TICKS.saturating_add(since_epoch)
}

/// Converts 100ns ticks since 0001-01-01 back into a timestamp.
pub(crate) fn from_ticks(ticks: i64) -> SystemTime {
    let since_epoch = ticks.saturating_sub(UNIX_EPOCH_TICKS);
    let magnitude = Duration::from_nanos(since_epoch.unsigned_abs().saturating_mul(100));
    if since_epoch >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH.checked_sub(magnitude).unwrap_or(UNIX_EPOCH)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The fields written for an item, already encoded as Redis arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncodedItem {
    pub(crate) value: String,
    pub(crate) value_type: &'static str,
    pub(crate) expiration: u8,
    pub(crate) timeout_ms: u64,
    pub(crate) created_ticks: i64,
    pub(crate) default_expiration: &'static str,
    /// TTL to apply to the hash; zero persists it.
    pub(crate) ttl_ms: u64,
}

impl EncodedItem {
    pub(crate) fn encode<V: Serialize>(item: &CacheItem<V>, now: SystemTime) -> Result<Self> {
        let value = serde_json::to_string(item.value()).map_err(|e| Error::with_cause(ErrorKind::Serialization, e))?;
        Ok(Self {
            value,
            value_type: item.value_type(),
            expiration: expiration_code(item.expiration_mode()),
            timeout_ms: millis(item.expiration_timeout()),
            created_ticks: to_ticks(item.created().unwrap_or(now)),
            default_expiration: if item.uses_expiration_defaults() { "True" } else { "False" },
            ttl_ms: item.remaining_at(now).map_or(0, |remaining| millis(remaining).max(1)),
        })
    }

    /// Field/value pairs for `HSET`, excluding the version.
    pub(crate) fn fields(&self) -> [(&'static str, String); 6] {
        [
            (FIELD_VALUE, self.value.clone()),
            (FIELD_TYPE, self.value_type.to_owned()),
            (FIELD_EXPIRATION, self.expiration.to_string()),
            (FIELD_TIMEOUT, self.timeout_ms.to_string()),
            (FIELD_CREATED, self.created_ticks.to_string()),
            (FIELD_DEFAULT_EXPIRATION, self.default_expiration.to_owned()),
        ]
    }
}

/// An item read back from Redis together with its version.
#[derive(Debug, Clone)]
pub(crate) struct StoredItem<V> {
    pub(crate) item: CacheItem<V>,
    pub(crate) raw_value: String,
    pub(crate) version: i64,
}

/// Decodes the [`READ_FIELDS`] of a hash. Returns `None` when the hash is missing.
pub(crate) fn decode_fields<V: DeserializeOwned>(
    key: &str,
    region: Option<&str>,
    fields: &[Option<String>],
    now: SystemTime,
) -> Result<Option<StoredItem<V>>> {
    let field = |index: usize| fields.get(index).and_then(Option::as_deref);

    let Some(raw_value) = field(0) else {
        return Ok(None);
    };

    let value: V = serde_json::from_str(raw_value).map_err(|e| Error::with_cause(ErrorKind::Serialization, e))?;

    let mode = field(1)
        .and_then(|code| code.parse::<u8>().ok())
        .and_then(expiration_from_code)
        .unwrap_or(ExpirationMode::None);
    let timeout = Duration::from_millis(field(2).and_then(|ms| ms.parse().ok()).unwrap_or(0));
    let created = field(3).and_then(|ticks| ticks.parse().ok()).map_or(now, from_ticks);
    let version = field(4).and_then(|version| version.parse().ok()).unwrap_or(0);
    let uses_defaults = field(5).is_some_and(|flag| flag.eq_ignore_ascii_case("true"));

    let item = match region {
        Some(region) => CacheItem::in_region(key, region, value)?,
        None => CacheItem::new(key, value)?,
    };

    let item = if uses_defaults || mode == ExpirationMode::Default {
        item.apply_defaults(mode, timeout)
    } else {
        item.with_expiration(mode, timeout)
            .map_err(|e| Error::with_cause(ErrorKind::Serialization, e))?
    };

    Ok(Some(StoredItem {
        item: item.with_created(created).touched(now),
        raw_value: raw_value.to_owned(),
        version,
    }))
}
