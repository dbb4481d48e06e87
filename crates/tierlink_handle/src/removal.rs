// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

/// Why a handle dropped an item on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RemovalReason {
    /// The item outlived its expiration.
    Expired,
    /// The store evicted the item under memory pressure.
    Evicted,
    /// Something outside this process deleted the item.
    ExternalDelete,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Expired => "expired",
            Self::Evicted => "evicted",
            Self::ExternalDelete => "external delete",
        })
    }
}

/// A removal reported by a handle without a caller asking for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemovalEvent {
    /// The removed key.
    pub key: String,
    /// The region of the removed key, if any.
    pub region: Option<String>,
    /// Why the item was removed.
    pub reason: RemovalReason,
}

impl RemovalEvent {
    /// Creates a removal event.
    #[must_use]
    pub fn new(key: impl Into<String>, region: Option<&str>, reason: RemovalReason) -> Self {
        Self {
            key: key.into(),
            region: region.map(str::to_owned),
            reason,
        }
    }
}
