// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process cache handle backed by moka.
//!
//! Per-key atomicity comes from moka's entry API: adds use
//! `or_insert_with_if` and every read-modify-write goes through
//! `and_compute_with`, so an update always settles on its first attempt.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{
    Expiry,
    notification::RemovalCause,
    ops::compute::{CompResult, Op},
    sync::Cache,
};
use tick::Clock;
use tierlink_handle::{
    CacheHandle, CacheItem, Error, ErrorKind, ExpirationMode, HandleConfiguration, HandleStats, ObserverList, RemovalEvent,
    RemovalReason, Result, StatsCounter, UpdateFn, UpdateResult,
};

use crate::builder::InMemoryHandleBuilder;

/// The moka key: an item key together with its optional region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ItemKey {
    key: String,
    region: Option<String>,
}

impl ItemKey {
    fn new(key: &str, region: Option<&str>) -> Self {
        Self {
            key: key.to_owned(),
            region: region.map(str::to_owned),
        }
    }
}

/// Maps item expiration onto moka's per-entry expiry.
struct ItemExpiry {
    clock: Clock,
}

impl<V> Expiry<ItemKey, CacheItem<V>> for ItemExpiry {
    fn expire_after_create(&self, _key: &ItemKey, item: &CacheItem<V>, _created_at: Instant) -> Option<Duration> {
        item.remaining_at(self.clock.system_time())
    }

    fn expire_after_read(
        &self,
        _key: &ItemKey,
        item: &CacheItem<V>,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        if item.expiration_mode() == ExpirationMode::Sliding {
            Some(item.expiration_timeout())
        } else {
            duration_until_expiry
        }
    }

    fn expire_after_update(
        &self,
        _key: &ItemKey,
        item: &CacheItem<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        item.remaining_at(self.clock.system_time())
    }
}

/// An in-process cache handle backed by moka.
///
/// This handle provides:
/// - Per-key atomic add, get and update
/// - Capacity-bounded eviction, reported as [`RemovalReason::Evicted`]
/// - Absolute and sliding expiration, checked against the handle's clock
///
/// # Examples
///
/// ```
/// use tick::Clock;
/// use tierlink_handle::{CacheHandle, CacheItem, HandleConfiguration};
/// use tierlink_memory::InMemoryHandle;
/// # futures::executor::block_on(async {
///
/// let handle = InMemoryHandle::<i32>::builder(HandleConfiguration::new("memory"), Clock::new_frozen())
///     .max_capacity(1_000)
///     .build()?;
///
/// handle.put(CacheItem::new("key", 42)?).await?;
/// assert_eq!(*handle.get("key", None).await?.unwrap().value(), 42);
/// # Ok::<(), tierlink_handle::Error>(())
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<ItemKey, CacheItem<V>>,
    configuration: Arc<HandleConfiguration>,
    stats: Arc<HandleStats>,
    removals: Arc<ObserverList<RemovalEvent>>,
    clock: Clock,
}

impl<V> std::fmt::Debug for InMemoryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryHandle")
            .field("name", &self.configuration.name())
            .field("entry_count", &self.inner.entry_count())
            .finish_non_exhaustive()
    }
}

impl<V> InMemoryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new builder for an in-memory handle.
    #[must_use]
    pub fn builder(configuration: HandleConfiguration, clock: Clock) -> InMemoryHandleBuilder<V> {
        InMemoryHandleBuilder::new(configuration, clock)
    }

    /// Constructs an `InMemoryHandle` from a builder.
    pub(crate) fn from_builder(builder: InMemoryHandleBuilder<V>) -> Self {
        let removals = Arc::new(ObserverList::new());
        let listener_removals = Arc::clone(&removals);
        let name = builder.configuration.name().to_owned();

        let mut moka_builder = Cache::builder()
            .name(&name)
            .support_invalidation_closures()
            .expire_after(ItemExpiry {
                clock: builder.clock.clone(),
            })
            .eviction_listener(move |key: Arc<ItemKey>, _item, cause| {
                let reason = match cause {
                    RemovalCause::Expired => RemovalReason::Expired,
                    RemovalCause::Size => RemovalReason::Evicted,
                    RemovalCause::Explicit | RemovalCause::Replaced => return,
                };
                tracing::debug!(cache.key = %key.key, cache.region = ?key.region, %reason, "memory handle dropped item");
                listener_removals.notify(&RemovalEvent::new(key.key.clone(), key.region.as_deref(), reason));
            });

        if let Some(capacity) = builder.max_capacity {
            moka_builder = moka_builder.max_capacity(capacity);
        }

        if let Some(capacity) = builder.initial_capacity {
            moka_builder = moka_builder.initial_capacity(capacity);
        }

        Self {
            inner: moka_builder.build(),
            stats: Arc::new(HandleStats::new(builder.configuration.enable_statistics())),
            configuration: Arc::new(builder.configuration),
            removals,
            clock: builder.clock,
        }
    }

    fn prepare(&self, item: CacheItem<V>) -> CacheItem<V> {
        let now = self.clock.system_time();
        item.apply_defaults(self.configuration.expiration_mode(), self.configuration.expiration_timeout())
            .ensure_created(now)
            .touched(now)
    }

    fn report_expired(&self, key: &str, region: Option<&str>) {
        tracing::debug!(cache.name = self.configuration.name(), cache.key = key, cache.region = region, "expired item removed");
        self.removals.notify(&RemovalEvent::new(key, region, RemovalReason::Expired));
    }
}

impl<V> CacheHandle<V> for InMemoryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn configuration(&self) -> &HandleConfiguration {
        &self.configuration
    }

    fn stats(&self) -> &HandleStats {
        &self.stats
    }

    fn removals(&self) -> &ObserverList<RemovalEvent> {
        &self.removals
    }

    fn count(&self) -> Option<u64> {
        self.inner.run_pending_tasks();
        Some(self.inner.entry_count())
    }

    async fn add(&self, item: CacheItem<V>) -> Result<bool> {
        self.stats.record(StatsCounter::Add);
        let now = self.clock.system_time();
        let key = ItemKey::new(item.key(), item.region());
        let item = self.prepare(item);

        let entry = self
            .inner
            .entry(key)
            .or_insert_with_if(|| item, |existing| existing.is_expired_at(now));
        Ok(entry.is_fresh())
    }

    async fn put(&self, item: CacheItem<V>) -> Result<()> {
        self.stats.record(StatsCounter::Put);
        let key = ItemKey::new(item.key(), item.region());
        self.inner.insert(key, self.prepare(item));
        Ok(())
    }

    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<V>>> {
        self.stats.record(StatsCounter::Get);
        let now = self.clock.system_time();

        let result = self
            .inner
            .entry(ItemKey::new(key, region))
            .and_compute_with(|current| match current.map(moka::Entry::into_value) {
                None => Op::Nop,
                Some(item) if item.is_expired_at(now) => Op::Remove,
                Some(item) => Op::Put(item.touched(now)),
            });

        match result {
            CompResult::Removed(_) => {
                self.report_expired(key, region);
                Ok(None)
            }
            CompResult::ReplacedWith(entry) | CompResult::Unchanged(entry) | CompResult::Inserted(entry) => {
                Ok(Some(entry.into_value()))
            }
            CompResult::StillNone(_) => Ok(None),
        }
    }

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        let now = self.clock.system_time();
        Ok(self
            .inner
            .get(&ItemKey::new(key, region))
            .is_some_and(|item| !item.is_expired_at(now)))
    }

    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.stats.record(StatsCounter::Remove);
        Ok(self.inner.remove(&ItemKey::new(key, region)).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.stats.record(StatsCounter::Clear);
        self.inner.invalidate_all();
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> Result<()> {
        self.stats.record(StatsCounter::ClearRegion);
        let region = region.to_owned();
        self.inner
            .invalidate_entries_if(move |key, _| key.region.as_deref() == Some(region.as_str()))
            .map_err(|e| Error::with_cause(ErrorKind::Store, e))?;
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<V>,
        _max_retries: u32,
    ) -> Result<UpdateResult<V>> {
        self.stats.record(StatsCounter::Update);
        let now = self.clock.system_time();
        let mut outcome = UpdateResult::ItemDidNotExist;
        let mut expired = false;

        self.inner
            .entry(ItemKey::new(key, region))
            .and_compute_with(|current| match current.map(moka::Entry::into_value) {
                None => Op::Nop,
                Some(item) if item.is_expired_at(now) => {
                    expired = true;
                    Op::Remove
                }
                Some(item) => match update_fn(item.value()) {
                    None => {
                        outcome = UpdateResult::FactoryReturnedNone;
                        Op::Nop
                    }
                    Some(value) => {
                        let updated = item.with_value(value).touched(now);
                        outcome = UpdateResult::success(updated.clone(), 1);
                        Op::Put(updated)
                    }
                },
            });

        if expired {
            self.report_expired(key, region);
        }

        Ok(outcome)
    }

    fn dispose(&self) {
        self.inner.invalidate_all();
        self.removals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_key_distinguishes_regions() {
        assert_ne!(ItemKey::new("k", None), ItemKey::new("k", Some("r")));
        assert_eq!(ItemKey::new("k", Some("r")), ItemKey::new("k", Some("r")));
    }

    #[test]
    fn sliding_expiry_resets_on_read() {
        let clock = Clock::new_frozen();
        let expiry = ItemExpiry { clock: clock.clone() };
        let item = CacheItem::new("k", 1)
            .unwrap()
            .with_sliding_expiration(Duration::from_secs(30))
            .unwrap()
            .with_created(clock.system_time());
        let key = ItemKey::new("k", None);

        assert_eq!(
            expiry.expire_after_create(&key, &item, Instant::now()),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            expiry.expire_after_read(&key, &item, Instant::now(), Some(Duration::from_secs(1)), Instant::now()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn untimed_items_have_no_moka_expiry() {
        let expiry = ItemExpiry {
            clock: Clock::new_frozen(),
        };
        let item = CacheItem::new("k", 1).unwrap().with_no_expiration();
        assert_eq!(expiry.expire_after_create(&ItemKey::new("k", None), &item, Instant::now()), None);
    }
}
