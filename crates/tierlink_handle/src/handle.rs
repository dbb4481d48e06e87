// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The contract every cache tier implements.
//!
//! A [`CacheHandle`] stores [`CacheItem`]s for one tier. The manager orders
//! several handles from nearest to the source of truth and keeps them
//! consistent; the handle itself only has to make each single operation atomic.

use crate::{CacheItem, HandleConfiguration, HandleStats, ObserverList, RemovalEvent, Result, UpdateFn, UpdateResult};

/// Trait for cache tier implementations.
///
/// Keys are addressed as `(key, region)` pairs. All async operations must be
/// safe to call concurrently from any thread.
///
/// Only [`CacheHandle::is_distributed`] and [`CacheHandle::count`] have default
/// implementations:
/// - `is_distributed`: Returns `false`
/// - `count`: Returns `None` (not all tiers track size)
#[dynosaur::dynosaur(pub(crate) DynCacheHandle = dyn(box) CacheHandle, bridge(none))]
pub trait CacheHandle<V>: Send + Sync {
    /// Returns the configuration this handle was created with.
    fn configuration(&self) -> &HandleConfiguration;

    /// Returns the handle's operation counters.
    fn stats(&self) -> &HandleStats;

    /// Returns the observers notified when the handle drops an item on its own.
    fn removals(&self) -> &ObserverList<RemovalEvent>;

    /// Returns `true` if the store is shared with other processes.
    fn is_distributed(&self) -> bool {
        false
    }

    /// Returns the number of stored items, if supported.
    fn count(&self) -> Option<u64> {
        None
    }

    /// Inserts the item only if the key is absent. An expired item counts as absent.
    ///
    /// Returns `true` if the item was inserted.
    fn add(&self, item: CacheItem<V>) -> impl Future<Output = Result<bool>> + Send;

    /// Inserts or replaces the item.
    fn put(&self, item: CacheItem<V>) -> impl Future<Output = Result<()>> + Send;

    /// Returns the stored item.
    ///
    /// Expired items are removed, reported as [`RemovalReason::Expired`](crate::RemovalReason::Expired)
    /// and treated as a miss. Sliding items have their last-accessed time refreshed.
    fn get(&self, key: &str, region: Option<&str>) -> impl Future<Output = Result<Option<CacheItem<V>>>> + Send;

    /// Returns `true` if a live item is stored under the key.
    fn exists(&self, key: &str, region: Option<&str>) -> impl Future<Output = Result<bool>> + Send;

    /// Removes the key. Returns `true` if something was removed.
    fn remove(&self, key: &str, region: Option<&str>) -> impl Future<Output = Result<bool>> + Send;

    /// Removes every item.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    /// Removes every item in `region`.
    fn clear_region(&self, region: &str) -> impl Future<Output = Result<()>> + Send;

    /// Reads the stored value, computes a new one and writes it back if nothing changed in between.
    ///
    /// The handle runs at most `max_retries` attempts (at least one) before
    /// reporting [`UpdateResult::TooManyRetries`].
    fn update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> impl Future<Output = Result<UpdateResult<V>>> + Send;

    /// Releases background resources. Calling it more than once has no further effect.
    fn dispose(&self);
}
