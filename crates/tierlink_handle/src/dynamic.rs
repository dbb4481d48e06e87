// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dynamic cache handle wrapper for type erasure.

use std::{fmt::Debug, sync::Arc};

use crate::{
    CacheHandle, CacheItem, HandleConfiguration, HandleStats, ObserverList, RemovalEvent, Result, UpdateFn, UpdateResult,
    handle::DynCacheHandle,
};

/// Extension trait for converting any `CacheHandle` into a `DynamicHandle`.
///
/// # Examples
///
/// ```
/// use tierlink_handle::{CacheHandle, DynamicHandle, IntoDynamicHandle};
///
/// fn erase<H>(handle: H) -> DynamicHandle<String>
/// where
///     H: CacheHandle<String> + 'static,
/// {
///     handle.into_dynamic()
/// }
/// ```
pub trait IntoDynamicHandle<V>: Sized {
    /// Converts this handle into a `DynamicHandle`.
    fn into_dynamic(self) -> DynamicHandle<V>;
}

impl<V, T> IntoDynamicHandle<V> for T
where
    T: CacheHandle<V> + 'static,
{
    fn into_dynamic(self) -> DynamicHandle<V> {
        DynamicHandle::new(self)
    }
}

/// A clonable, type-erased cache handle.
///
/// The manager keeps its tiers as `DynamicHandle`s so that in-memory and
/// distributed handles can sit in the same ordered list.
pub struct DynamicHandle<V>(Arc<DynCacheHandle<'static, V>>);

impl<V> DynamicHandle<V> {
    /// Wraps any `CacheHandle` implementation.
    pub fn new<T>(handle: T) -> Self
    where
        T: CacheHandle<V> + 'static,
    {
        Self(DynCacheHandle::new_arc(handle))
    }

    /// Returns `true` if both values wrap the same handle instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<V> Debug for DynamicHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicHandle")
            .field("name", &self.0.configuration().name())
            .finish()
    }
}

impl<V> Clone for DynamicHandle<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V> CacheHandle<V> for DynamicHandle<V>
where
    V: Send + Sync,
{
    fn configuration(&self) -> &HandleConfiguration {
        self.0.configuration()
    }

    fn stats(&self) -> &HandleStats {
        self.0.stats()
    }

    fn removals(&self) -> &ObserverList<RemovalEvent> {
        self.0.removals()
    }

    fn is_distributed(&self) -> bool {
        self.0.is_distributed()
    }

    fn count(&self) -> Option<u64> {
        self.0.count()
    }

    async fn add(&self, item: CacheItem<V>) -> Result<bool> {
        self.0.add(item).await
    }

    async fn put(&self, item: CacheItem<V>) -> Result<()> {
        self.0.put(item).await
    }

    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<V>>> {
        self.0.get(key, region).await
    }

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.0.exists(key, region).await
    }

    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.0.remove(key, region).await
    }

    async fn clear(&self) -> Result<()> {
        self.0.clear().await
    }

    async fn clear_region(&self, region: &str) -> Result<()> {
        self.0.clear_region(region).await
    }

    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> Result<UpdateResult<V>> {
        self.0.update(key, region, update_fn, max_retries).await
    }

    fn dispose(&self) {
        self.0.dispose();
    }
}
