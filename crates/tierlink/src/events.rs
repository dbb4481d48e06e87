// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tierlink_handle::RemovalReason;

/// Where the change behind an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOrigin {
    /// A call on this manager.
    Local,
    /// A backplane message from another instance.
    Remote,
}

/// A change observed by a [`CacheManager`](crate::CacheManager).
///
/// Subscribe through [`CacheManager::events`](crate::CacheManager::events).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheEvent {
    /// An item was added.
    Add {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
        /// Where the change came from.
        origin: EventOrigin,
    },
    /// An item was read.
    Get {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// An item was put.
    Put {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
        /// Where the change came from.
        origin: EventOrigin,
    },
    /// An item was removed.
    Remove {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
        /// Where the change came from.
        origin: EventOrigin,
    },
    /// An item was updated.
    Update {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
        /// Where the change came from.
        origin: EventOrigin,
    },
    /// Every item was removed.
    Clear {
        /// Where the change came from.
        origin: EventOrigin,
    },
    /// Every item in a region was removed.
    ClearRegion {
        /// The region.
        region: String,
        /// Where the change came from.
        origin: EventOrigin,
    },
    /// A handle dropped an item on its own.
    RemoveByHandle {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
        /// Why the handle dropped it.
        reason: RemovalReason,
        /// Index of the reporting handle.
        level: usize,
    },
}

impl CacheEvent {
    /// Returns the affected key, if the event has one.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Add { key, .. }
            | Self::Get { key, .. }
            | Self::Put { key, .. }
            | Self::Remove { key, .. }
            | Self::Update { key, .. }
            | Self::RemoveByHandle { key, .. } => Some(key),
            Self::Clear { .. } | Self::ClearRegion { .. } => None,
        }
    }

    /// Returns the affected region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Add { region, .. }
            | Self::Get { region, .. }
            | Self::Put { region, .. }
            | Self::Remove { region, .. }
            | Self::Update { region, .. }
            | Self::RemoveByHandle { region, .. } => region.as_deref(),
            Self::ClearRegion { region, .. } => Some(region),
            Self::Clear { .. } => None,
        }
    }

    /// Returns where the change came from. Reads and handle removals are always local.
    #[must_use]
    pub fn origin(&self) -> EventOrigin {
        match self {
            Self::Add { origin, .. }
            | Self::Put { origin, .. }
            | Self::Remove { origin, .. }
            | Self::Update { origin, .. }
            | Self::Clear { origin }
            | Self::ClearRegion { origin, .. } => *origin,
            Self::Get { .. } | Self::RemoveByHandle { .. } => EventOrigin::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let event = CacheEvent::Update {
            key: "k".into(),
            region: Some("r".into()),
            origin: EventOrigin::Remote,
        };
        assert_eq!(event.key(), Some("k"));
        assert_eq!(event.region(), Some("r"));
        assert_eq!(event.origin(), EventOrigin::Remote);

        let clear = CacheEvent::ClearRegion {
            region: "r".into(),
            origin: EventOrigin::Local,
        };
        assert_eq!(clear.key(), None);
        assert_eq!(clear.region(), Some("r"));

        let removed = CacheEvent::RemoveByHandle {
            key: "k".into(),
            region: None,
            reason: RemovalReason::Expired,
            level: 1,
        };
        assert_eq!(removed.origin(), EventOrigin::Local);
    }
}
