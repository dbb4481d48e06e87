// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `CacheHandle` default implementations and dynamic dispatch.

use std::collections::HashMap;
use std::sync::Mutex;

use tierlink_handle::{
    CacheHandle, CacheItem, DynamicHandle, Error, HandleConfiguration, HandleStats, IntoDynamicHandle, ObserverList,
    RemovalEvent, UpdateFn, UpdateResult, update_fn,
};

type TestResult = Result<(), Error>;

/// Minimal implementation that only provides required methods
struct MinimalHandle {
    config: HandleConfiguration,
    stats: HandleStats,
    removals: ObserverList<RemovalEvent>,
    data: Mutex<HashMap<(String, Option<String>), CacheItem<i32>>>,
}

impl MinimalHandle {
    fn new() -> Self {
        Self {
            config: HandleConfiguration::new("minimal"),
            stats: HandleStats::default(),
            removals: ObserverList::new(),
            data: Mutex::new(HashMap::new()),
        }
    }

    fn slot(key: &str, region: Option<&str>) -> (String, Option<String>) {
        (key.to_owned(), region.map(str::to_owned))
    }
}

impl CacheHandle<i32> for MinimalHandle {
    fn configuration(&self) -> &HandleConfiguration {
        &self.config
    }

    fn stats(&self) -> &HandleStats {
        &self.stats
    }

    fn removals(&self) -> &ObserverList<RemovalEvent> {
        &self.removals
    }

    async fn add(&self, item: CacheItem<i32>) -> Result<bool, Error> {
        let mut data = self.data.lock().expect("lock poisoned");
        let slot = Self::slot(item.key(), item.region());
        if data.contains_key(&slot) {
            return Ok(false);
        }
        data.insert(slot, item);
        Ok(true)
    }

    async fn put(&self, item: CacheItem<i32>) -> Result<(), Error> {
        self.data
            .lock()
            .expect("lock poisoned")
            .insert(Self::slot(item.key(), item.region()), item);
        Ok(())
    }

    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<i32>>, Error> {
        Ok(self.data.lock().expect("lock poisoned").get(&Self::slot(key, region)).cloned())
    }

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool, Error> {
        Ok(self.data.lock().expect("lock poisoned").contains_key(&Self::slot(key, region)))
    }

    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool, Error> {
        Ok(self.data.lock().expect("lock poisoned").remove(&Self::slot(key, region)).is_some())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.data.lock().expect("lock poisoned").clear();
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> Result<(), Error> {
        self.data
            .lock()
            .expect("lock poisoned")
            .retain(|(_, item_region), _| item_region.as_deref() != Some(region));
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<i32>,
        _max_retries: u32,
    ) -> Result<UpdateResult<i32>, Error> {
        let mut data = self.data.lock().expect("lock poisoned");
        let Some(current) = data.get(&Self::slot(key, region)).cloned() else {
            return Ok(UpdateResult::ItemDidNotExist);
        };
        let Some(value) = update_fn(current.value()) else {
            return Ok(UpdateResult::FactoryReturnedNone);
        };
        let item = current.with_value(value);
        data.insert(Self::slot(key, region), item.clone());
        Ok(UpdateResult::success(item, 1))
    }

    fn dispose(&self) {}
}

#[tokio::test]
async fn defaults_report_local_and_uncounted() {
    let handle = MinimalHandle::new();
    assert!(!handle.is_distributed());
    assert_eq!(handle.count(), None);
}

#[tokio::test]
async fn dynamic_handle_forwards_operations() -> TestResult {
    let handle: DynamicHandle<i32> = MinimalHandle::new().into_dynamic();

    assert!(handle.add(CacheItem::new("k", 1)?).await?);
    assert!(!handle.add(CacheItem::new("k", 2)?).await?);
    assert_eq!(*handle.get("k", None).await?.expect("item").value(), 1);

    let result = handle.update("k", None, update_fn(|v: &i32| Some(v + 10)), 3).await?;
    assert_eq!(*result.into_item().expect("updated").value(), 11);

    assert!(handle.remove("k", None).await?);
    assert!(!handle.exists("k", None).await?);
    assert_eq!(handle.configuration().name(), "minimal");
    Ok(())
}

#[tokio::test]
async fn dynamic_handle_clones_share_the_instance() -> TestResult {
    let handle = DynamicHandle::new(MinimalHandle::new());
    let clone = handle.clone();
    assert!(handle.ptr_eq(&clone));

    clone.put(CacheItem::in_region("k", "r", 5)?).await?;
    assert!(handle.exists("k", Some("r")).await?);

    handle.clear_region("r").await?;
    assert!(!clone.exists("k", Some("r")).await?);
    Ok(())
}

#[tokio::test]
async fn update_on_missing_key_reports_item_did_not_exist() -> TestResult {
    let handle = MinimalHandle::new().into_dynamic();
    let result = handle.update("missing", None, update_fn(|v: &i32| Some(*v)), 1).await?;
    assert_eq!(result, UpdateResult::ItemDidNotExist);
    Ok(())
}
