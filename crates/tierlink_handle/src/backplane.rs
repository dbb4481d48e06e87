// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The cross-process change notification contract.

use std::fmt;

use crate::ObserverList;

/// Identifies the backplane instance that produced a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginId([u8; 16]);

impl OriginId {
    /// Wraps 16 raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OriginId({self})")
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The kind of write that changed an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    /// The item was added.
    Add,
    /// The item was put.
    Put,
    /// The item was updated.
    Update,
}

/// What a backplane message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackplaneAction {
    /// An item was written.
    Changed(ChangeAction),
    /// An item was removed.
    Removed,
    /// Every item was removed.
    Clear,
    /// Every item in a region was removed.
    ClearRegion,
}

/// A change notification exchanged between processes.
///
/// Equality covers every field, so a pending batch can drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackplaneMessage {
    origin: OriginId,
    action: BackplaneAction,
    key: Option<String>,
    region: Option<String>,
}

impl BackplaneMessage {
    /// Reports a write to `key`.
    #[must_use]
    pub fn changed(origin: OriginId, key: &str, region: Option<&str>, action: ChangeAction) -> Self {
        Self::new(origin, BackplaneAction::Changed(action), Some(key), region)
    }

    /// Reports the removal of `key`.
    #[must_use]
    pub fn removed(origin: OriginId, key: &str, region: Option<&str>) -> Self {
        Self::new(origin, BackplaneAction::Removed, Some(key), region)
    }

    /// Reports a full clear.
    #[must_use]
    pub fn clear(origin: OriginId) -> Self {
        Self::new(origin, BackplaneAction::Clear, None, None)
    }

    /// Reports a clear of `region`.
    #[must_use]
    pub fn clear_region(origin: OriginId, region: &str) -> Self {
        Self::new(origin, BackplaneAction::ClearRegion, None, Some(region))
    }

    /// Builds a message from its parts, as a decoder does.
    #[must_use]
    pub fn new(origin: OriginId, action: BackplaneAction, key: Option<&str>, region: Option<&str>) -> Self {
        Self {
            origin,
            action,
            key: key.map(str::to_owned),
            region: region.map(str::to_owned),
        }
    }

    /// Returns a copy attributed to `origin`.
    #[must_use]
    pub fn with_origin(self, origin: OriginId) -> Self {
        Self { origin, ..self }
    }

    /// Returns the sender's identifier.
    #[must_use]
    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Returns what happened.
    #[must_use]
    pub fn action(&self) -> BackplaneAction {
        self.action
    }

    /// Returns the affected key, if the action has one.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Returns the affected region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

/// Spreads cache changes to other processes and delivers theirs.
///
/// Notify calls never block on the network and never fail; delivery is best effort.
/// Messages received from other instances are handed to [`CacheBackplane::messages`]
/// observers. Messages carrying this instance's own [`OriginId`] are never delivered.
pub trait CacheBackplane: Send + Sync + fmt::Debug {
    /// Returns this instance's identifier.
    fn identifier(&self) -> OriginId;

    /// Queues a change notification.
    fn notify_change(&self, key: &str, region: Option<&str>, action: ChangeAction);

    /// Queues a removal notification.
    fn notify_remove(&self, key: &str, region: Option<&str>);

    /// Queues a clear notification.
    fn notify_clear(&self);

    /// Queues a region clear notification.
    fn notify_clear_region(&self, region: &str);

    /// Returns the observers that receive messages from other instances.
    fn messages(&self) -> &ObserverList<BackplaneMessage>;

    /// Stops receiving and sending. Calling it more than once has no further effect.
    fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn equal_messages_deduplicate() {
        let origin = OriginId::from_bytes([7; 16]);
        let mut set = HashSet::new();
        set.insert(BackplaneMessage::changed(origin, "k", None, ChangeAction::Put));
        set.insert(BackplaneMessage::changed(origin, "k", None, ChangeAction::Put));
        set.insert(BackplaneMessage::changed(origin, "k", Some("r"), ChangeAction::Put));
        set.insert(BackplaneMessage::changed(origin, "k", None, ChangeAction::Add));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn origin_displays_as_hex() {
        let origin = OriginId::from_bytes([0xab; 16]);
        assert_eq!(origin.to_string(), "ab".repeat(16));
    }

    #[test]
    fn clear_carries_no_key() {
        let message = BackplaneMessage::clear(OriginId::from_bytes([0; 16]));
        assert_eq!(message.key(), None);
        assert_eq!(message.region(), None);
        assert_eq!(message.action(), BackplaneAction::Clear);
    }
}
