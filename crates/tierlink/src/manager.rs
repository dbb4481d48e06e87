// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    fmt::Debug,
    pin::pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::{Either, select};
use parking_lot::Mutex;
use tick::Clock;
use tierlink_handle::{
    BackplaneAction, BackplaneMessage, CacheBackplane, CacheHandle, CacheItem, ChangeAction, DynamicHandle, Error, ErrorKind,
    ExpirationMode, ObserverList, RemovalEvent, RemovalReason, Result, StatsCounter, Subscription, UpdateFn, UpdateResult,
    retry::{Attempt, Outcome, retry_until_settled},
};
use tokio::task::JoinHandle;

use crate::{
    CacheEvent, CacheManagerBuilder, EventOrigin, ManagerConfiguration, UpdateMode,
    queue::{Notification, NotificationQueue},
};

/// Coordinates an ordered list of cache handles.
///
/// Handle 0 is the nearest tier and the last handle is the source of truth.
/// Reads scan from the nearest tier and back-fill on a hit. Writes that need
/// atomicity go to the source of truth, after which stale copies in the other
/// handles are evicted. An optional backplane spreads changes to other
/// processes and evicts what they change.
///
/// Cloning is cheap: clones share the same handles, backplane and event observers.
///
/// # Examples
///
/// ```
/// use tick::Clock;
/// use tierlink::{CacheItem, CacheManager, HandleConfiguration, InMemoryHandle, ManagerConfiguration, update_fn};
///
/// # futures::executor::block_on(async {
/// let clock = Clock::new_frozen();
/// let manager = CacheManager::<u64>::builder(ManagerConfiguration::new("counters"), clock.clone())
///     .handle(InMemoryHandle::builder(HandleConfiguration::new("memory"), clock).build()?)
///     .build()?;
///
/// manager.put(CacheItem::new("visits", 1_u64)?).await?;
/// let item = manager.update("visits", None, update_fn(|v: &u64| Some(v + 1)), 10).await?;
/// assert_eq!(*item.value(), 2);
/// # Ok::<(), tierlink::Error>(())
/// # });
/// ```
pub struct CacheManager<V> {
    inner: Arc<ManagerInner<V>>,
}

struct ManagerInner<V> {
    configuration: ManagerConfiguration,
    clock: Clock,
    handles: Vec<DynamicHandle<V>>,
    backplane: Option<Arc<dyn CacheBackplane>>,
    events: ObserverList<CacheEvent>,
    queue: Arc<NotificationQueue>,
    subscriptions: Mutex<Vec<Subscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// What a notification asks the manager to drop.
enum Eviction<'a> {
    Key(&'a str, Option<&'a str>),
    Region(&'a str),
    All,
}

impl<V> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Debug for CacheManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("name", &self.inner.configuration.name())
            .field("handles", &self.inner.handles)
            .field("backplane", &self.inner.backplane)
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V> Drop for ManagerInner<V> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Starts building a manager.
    #[must_use]
    pub fn builder(configuration: ManagerConfiguration, clock: Clock) -> CacheManagerBuilder<V> {
        CacheManagerBuilder::new(configuration, clock)
    }

    pub(crate) fn from_builder(builder: CacheManagerBuilder<V>) -> Self {
        let queue = Arc::new(NotificationQueue::default());
        let mut subscriptions = Vec::with_capacity(builder.handles.len() + 1);

        for (level, handle) in builder.handles.iter().enumerate() {
            let queue = Arc::clone(&queue);
            subscriptions.push(handle.removals().subscribe(move |event: &RemovalEvent| {
                queue.push(Notification::Removal {
                    level,
                    event: event.clone(),
                });
            }));
        }

        if let Some(backplane) = &builder.backplane {
            let queue = Arc::clone(&queue);
            subscriptions.push(
                backplane
                    .messages()
                    .subscribe(move |message: &BackplaneMessage| queue.push(Notification::Backplane(message.clone()))),
            );
        }

        let inner = Arc::new(ManagerInner {
            configuration: builder.configuration,
            clock: builder.clock,
            handles: builder.handles,
            backplane: builder.backplane,
            events: ObserverList::new(),
            queue,
            subscriptions: Mutex::new(subscriptions),
            worker: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let worker = runtime.spawn(process_notifications(Arc::downgrade(&inner), Arc::clone(&inner.queue)));
            *inner.worker.lock() = Some(worker);
        }

        tracing::debug!(
            cache.name = inner.configuration.name(),
            handles = inner.handles.len(),
            backplane = inner.backplane.is_some(),
            "cache manager created"
        );

        Self { inner }
    }

    /// Returns the manager configuration.
    #[must_use]
    pub fn configuration(&self) -> &ManagerConfiguration {
        &self.inner.configuration
    }

    /// Returns the handles, nearest first.
    #[must_use]
    pub fn handles(&self) -> &[DynamicHandle<V>] {
        &self.inner.handles
    }

    /// Returns the backplane, if one was configured.
    #[must_use]
    pub fn backplane(&self) -> Option<&Arc<dyn CacheBackplane>> {
        self.inner.backplane.as_ref()
    }

    /// Returns the observers notified about every change the manager sees.
    #[must_use]
    pub fn events(&self) -> &ObserverList<CacheEvent> {
        &self.inner.events
    }

    /// Returns the number of queued backplane messages and handle removals.
    #[must_use]
    pub fn pending_notifications(&self) -> usize {
        self.inner.queue.len()
    }

    /// Processes queued backplane messages and handle removals on the calling task.
    ///
    /// Returns the number of notifications processed. Waits if the background
    /// worker is processing at the same time.
    pub async fn process_pending_notifications(&self) -> usize {
        self.inner.drain().await
    }

    /// Adds the item to the source of truth if the key is absent there.
    ///
    /// Copies in other handles are evicted in either case, since they may hold
    /// an older version. Returns `true` if the item was added.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager was disposed or a handle fails.
    pub async fn add(&self, item: CacheItem<V>) -> Result<bool> {
        self.inner.ensure_active()?;
        let key = item.key().to_owned();
        let region = item.region().map(str::to_owned);

        let added = self.inner.source().add(item).await?;
        self.inner.evict_below(self.inner.source_level(), &key, region.as_deref()).await?;

        if added {
            self.inner.notify_change(&key, region.as_deref(), ChangeAction::Add);
            self.inner.events.notify(&CacheEvent::Add {
                key,
                region,
                origin: EventOrigin::Local,
            });
        }

        Ok(added)
    }

    /// Writes the item to every handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager was disposed or a handle fails.
    pub async fn put(&self, item: CacheItem<V>) -> Result<()> {
        self.inner.ensure_active()?;

        for handle in &self.inner.handles {
            handle.put(item.clone()).await?;
        }

        self.inner.notify_change(item.key(), item.region(), ChangeAction::Put);
        self.inner.events.notify(&CacheEvent::Put {
            key: item.key().to_owned(),
            region: item.region().map(str::to_owned),
            origin: EventOrigin::Local,
        });
        Ok(())
    }

    /// Returns the item from the nearest handle that has it.
    ///
    /// Nearer handles that missed are back-filled with the item, using their
    /// own default expiration. A failed back-fill is logged and does not fail the read.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the manager was disposed or a handle read fails.
    pub async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<V>>> {
        self.inner.ensure_active()?;
        validate_key(key, region)?;

        for (level, handle) in self.inner.handles.iter().enumerate() {
            let Some(item) = handle.get(key, region).await? else {
                handle.stats().record(StatsCounter::Miss);
                continue;
            };

            handle.stats().record(StatsCounter::Hit);
            tracing::debug!(
                cache.name = self.inner.configuration.name(),
                cache.key = key,
                cache.region = region,
                cache.level = level,
                "cache hit"
            );

            self.inner.backfill(level, &item).await;
            self.inner.events.notify(&CacheEvent::Get {
                key: key.to_owned(),
                region: region.map(str::to_owned),
            });
            return Ok(Some(item));
        }

        tracing::debug!(
            cache.name = self.inner.configuration.name(),
            cache.key = key,
            cache.region = region,
            "cache miss"
        );
        Ok(None)
    }

    /// Returns `true` if any handle holds a live item under the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the manager was disposed or a handle fails.
    pub async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.inner.ensure_active()?;
        validate_key(key, region)?;

        for handle in &self.inner.handles {
            if handle.exists(key, region).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes the key from every handle. Returns `true` if any handle had it.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the manager was disposed or a handle fails.
    pub async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.inner.ensure_active()?;
        validate_key(key, region)?;

        let mut removed = false;
        for handle in &self.inner.handles {
            removed |= handle.remove(key, region).await?;
        }

        if removed {
            if let Some(backplane) = &self.inner.backplane {
                backplane.notify_remove(key, region);
            }
            self.inner.events.notify(&CacheEvent::Remove {
                key: key.to_owned(),
                region: region.map(str::to_owned),
                origin: EventOrigin::Local,
            });
        }

        Ok(removed)
    }

    /// Removes every item from every handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager was disposed or a handle fails.
    pub async fn clear(&self) -> Result<()> {
        self.inner.ensure_active()?;

        for handle in &self.inner.handles {
            handle.clear().await?;
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.notify_clear();
        }
        self.inner.events.notify(&CacheEvent::Clear {
            origin: EventOrigin::Local,
        });
        Ok(())
    }

    /// Removes every item in `region` from every handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is empty, the manager was disposed or a handle fails.
    pub async fn clear_region(&self, region: &str) -> Result<()> {
        self.inner.ensure_active()?;
        if region.is_empty() {
            return Err(Error::invalid_argument("region must not be empty"));
        }

        for handle in &self.inner.handles {
            handle.clear_region(region).await?;
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.notify_clear_region(region);
        }
        self.inner.events.notify(&CacheEvent::ClearRegion {
            region: region.to_owned(),
            origin: EventOrigin::Local,
        });
        Ok(())
    }

    /// Updates the item in the source of truth and returns the raw outcome.
    ///
    /// On success, nearer copies are evicted and, with [`UpdateMode::PropagateUpward`],
    /// handles after the updating one receive the new item. When the item is
    /// missing or the retries run out, every other handle drops its copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the manager was disposed or a handle fails.
    pub async fn try_update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> Result<UpdateResult<V>> {
        self.inner.ensure_active()?;
        validate_key(key, region)?;

        let level = self.inner.source_level();
        let result = self.inner.source().update(key, region, update_fn, max_retries).await?;

        match &result {
            UpdateResult::Success { item, attempts, .. } => {
                self.inner.propagate_update(level, item).await?;
                self.inner.notify_change(key, region, ChangeAction::Update);
                self.inner.events.notify(&CacheEvent::Update {
                    key: key.to_owned(),
                    region: region.map(str::to_owned),
                    origin: EventOrigin::Local,
                });
                tracing::debug!(
                    cache.name = self.inner.configuration.name(),
                    cache.key = key,
                    cache.region = region,
                    attempts,
                    "item updated"
                );
            }
            UpdateResult::TooManyRetries { attempts } => {
                tracing::warn!(
                    cache.name = self.inner.configuration.name(),
                    cache.key = key,
                    cache.region = region,
                    attempts,
                    "update gave up after too many version conflicts"
                );
                self.inner.evict_except(level, key, region).await?;
            }
            UpdateResult::ItemDidNotExist => {
                self.inner.evict_except(level, key, region).await?;
            }
            UpdateResult::FactoryReturnedNone => {}
        }

        Ok(result)
    }

    /// Updates the item in the source of truth and returns the stored result.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`CacheManager::try_update`], returns
    /// [`ErrorKind::NotFound`] if the item does not exist,
    /// [`ErrorKind::FactoryReturnedNone`] if `update_fn` declined, and
    /// [`ErrorKind::RetriesExhausted`] if the version race was lost `max_retries` times.
    pub async fn update(&self, key: &str, region: Option<&str>, update_fn: UpdateFn<V>, max_retries: u32) -> Result<CacheItem<V>> {
        self.try_update(key, region, update_fn, max_retries).await?.into_result()
    }

    /// Adds the item, or updates the existing one with `update_fn`.
    ///
    /// Adding and updating alternate up to `max_retries + 1` times, since the
    /// item may be removed or added by someone else between the two.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::FactoryReturnedNone`] if `update_fn` declined,
    /// [`ErrorKind::RetriesExhausted`] if no attempt succeeded, and the errors
    /// of [`CacheManager::add`] and [`CacheManager::try_update`].
    pub async fn add_or_update(&self, item: CacheItem<V>, update_fn: UpdateFn<V>, max_retries: u32) -> Result<CacheItem<V>> {
        let key = item.key().to_owned();
        match self.add_or_update_outcome(item, update_fn, max_retries).await? {
            Outcome::Settled { value, .. } => Ok(value),
            Outcome::Exhausted { attempts } => {
                tracing::warn!(
                    cache.name = self.inner.configuration.name(),
                    cache.key = key.as_str(),
                    attempts,
                    "add or update gave up"
                );
                Err(Error::with_cause(
                    ErrorKind::RetriesExhausted,
                    format!("add or update gave up after {attempts} attempts"),
                ))
            }
        }
    }

    /// Like [`CacheManager::add_or_update`], but returns `Ok(None)` instead of
    /// failing when `update_fn` declines or the attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`CacheManager::add`] and [`CacheManager::try_update`].
    pub async fn try_add_or_update(
        &self,
        item: CacheItem<V>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> Result<Option<CacheItem<V>>> {
        match self.add_or_update_outcome(item, update_fn, max_retries).await {
            Ok(outcome) => Ok(outcome.settled()),
            Err(e) if e.kind() == ErrorKind::FactoryReturnedNone => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn add_or_update_outcome(
        &self,
        item: CacheItem<V>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> Result<Outcome<CacheItem<V>>> {
        retry_until_settled(max_retries.saturating_add(1), |_| {
            let item = item.clone();
            let update_fn = Arc::clone(&update_fn);
            async move {
                if self.add(item.clone()).await? {
                    return Ok(Attempt::Settled(item));
                }

                match self.try_update(item.key(), item.region(), update_fn, max_retries).await? {
                    UpdateResult::Success { item, .. } => Ok(Attempt::Settled(item)),
                    UpdateResult::FactoryReturnedNone => Err(Error::with_kind(ErrorKind::FactoryReturnedNone)),
                    UpdateResult::ItemDidNotExist | UpdateResult::TooManyRetries { .. } => Ok(Attempt::Retry),
                }
            }
        })
        .await
    }

    /// Returns the cached item, or adds the value produced by `factory`.
    ///
    /// The factory runs at most once. If another writer adds the key first,
    /// its item is returned instead.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::FactoryReturnedNone`] if the factory produced nothing,
    /// [`ErrorKind::RetriesExhausted`] if the key kept disappearing between add
    /// and read, and the errors of [`CacheManager::get`].
    pub async fn get_or_add<F>(&self, key: &str, region: Option<&str>, factory: F) -> Result<CacheItem<V>>
    where
        F: FnOnce() -> Option<V>,
    {
        if let Some(item) = self.get(key, region).await? {
            return Ok(item);
        }

        let value = factory().ok_or_else(|| Error::with_kind(ErrorKind::FactoryReturnedNone))?;
        self.insert_or_read(key, region, value).await
    }

    /// Like [`CacheManager::get_or_add`], but returns `Ok(None)` when the
    /// factory produces nothing or the attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`CacheManager::get`] and [`CacheManager::add`].
    pub async fn try_get_or_add<F>(&self, key: &str, region: Option<&str>, factory: F) -> Result<Option<CacheItem<V>>>
    where
        F: FnOnce() -> Option<V>,
    {
        swallow_give_up(self.get_or_add(key, region, factory).await)
    }

    /// Returns the cached item, or adds the value produced by an async factory.
    ///
    /// Completion of `cancellation` aborts the factory with [`ErrorKind::Cancelled`].
    /// Once the factory produced a value, the cache write runs to completion.
    ///
    /// # Errors
    ///
    /// See [`CacheManager::get_or_add`], plus [`ErrorKind::Cancelled`].
    pub async fn get_or_add_async<F, Fut, C>(&self, key: &str, region: Option<&str>, factory: F, cancellation: C) -> Result<CacheItem<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<V>>,
        C: Future<Output = ()>,
    {
        if let Some(item) = self.get(key, region).await? {
            return Ok(item);
        }

        let value = run_factory(factory(), cancellation)
            .await?
            .ok_or_else(|| Error::with_kind(ErrorKind::FactoryReturnedNone))?;
        self.insert_or_read(key, region, value).await
    }

    /// Like [`CacheManager::get_or_add_async`], but returns `Ok(None)` when the
    /// factory produces nothing or the attempts run out.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Cancelled`] on cancellation, and the errors of
    /// [`CacheManager::get`] and [`CacheManager::add`].
    pub async fn try_get_or_add_async<F, Fut, C>(
        &self,
        key: &str,
        region: Option<&str>,
        factory: F,
        cancellation: C,
    ) -> Result<Option<CacheItem<V>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<V>>,
        C: Future<Output = ()>,
    {
        swallow_give_up(self.get_or_add_async(key, region, factory, cancellation).await)
    }

    async fn insert_or_read(&self, key: &str, region: Option<&str>, value: V) -> Result<CacheItem<V>> {
        let item = match region {
            Some(region) => CacheItem::in_region(key, region, value)?,
            None => CacheItem::new(key, value)?,
        };

        let outcome = retry_until_settled(self.inner.configuration.max_retries(), |_| {
            let item = item.clone();
            async move {
                if self.add(item.clone()).await? {
                    return Ok(Attempt::Settled(item));
                }
                Ok::<_, Error>(self.get(key, region).await?.map_or(Attempt::Retry, Attempt::Settled))
            }
        })
        .await?;

        match outcome {
            Outcome::Settled { value, .. } => Ok(value),
            Outcome::Exhausted { attempts } => {
                tracing::warn!(
                    cache.name = self.inner.configuration.name(),
                    cache.key = key,
                    cache.region = region,
                    attempts,
                    "get or add gave up"
                );
                Err(Error::with_cause(
                    ErrorKind::RetriesExhausted,
                    format!("get or add gave up after {attempts} attempts"),
                ))
            }
        }
    }

    /// Replaces the expiration of a stored item. Returns `false` if the item does not exist.
    ///
    /// Timed expirations start counting at the time of the call.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the timeout does not fit the mode,
    /// and the errors of [`CacheManager::get`] and [`CacheManager::put`].
    pub async fn expire(&self, key: &str, region: Option<&str>, mode: ExpirationMode, timeout: Duration) -> Result<bool> {
        tierlink_handle::validate_expiration(mode, timeout)?;

        let Some(item) = self.get(key, region).await? else {
            return Ok(false);
        };

        let item = match mode {
            ExpirationMode::Default => item.with_default_expiration(),
            ExpirationMode::None => item.with_no_expiration(),
            ExpirationMode::Absolute | ExpirationMode::Sliding => item
                .with_expiration(mode, timeout)?
                .with_created(self.inner.clock.system_time()),
        };

        self.put(item).await?;
        Ok(true)
    }

    /// Makes a stored item never expire. Returns `false` if the item does not exist.
    ///
    /// # Errors
    ///
    /// See [`CacheManager::expire`].
    pub async fn remove_expiration(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.expire(key, region, ExpirationMode::None, Duration::ZERO).await
    }

    /// Disposes every handle, then the backplane, and stops processing notifications.
    ///
    /// Later operations fail with [`ErrorKind::Disposed`]. Calling it again has no effect.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        for handle in &self.inner.handles {
            handle.dispose();
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.dispose();
        }

        self.inner.subscriptions.lock().clear();
        self.inner.queue.clear();
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }

        tracing::debug!(cache.name = self.inner.configuration.name(), "cache manager disposed");
    }

    /// Returns `true` once [`CacheManager::dispose`] was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl<V> ManagerInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::with_kind(ErrorKind::Disposed));
        }
        Ok(())
    }

    fn source_level(&self) -> usize {
        self.handles.len() - 1
    }

    fn source(&self) -> &DynamicHandle<V> {
        &self.handles[self.source_level()]
    }

    fn notify_change(&self, key: &str, region: Option<&str>, action: ChangeAction) {
        if let Some(backplane) = &self.backplane {
            backplane.notify_change(key, region, action);
        }
    }

    async fn evict_below(&self, level: usize, key: &str, region: Option<&str>) -> Result<()> {
        for handle in &self.handles[..level] {
            handle.remove(key, region).await?;
        }
        Ok(())
    }

    async fn evict_except(&self, level: usize, key: &str, region: Option<&str>) -> Result<()> {
        for (index, handle) in self.handles.iter().enumerate() {
            if index != level {
                handle.remove(key, region).await?;
            }
        }
        Ok(())
    }

    async fn propagate_update(&self, level: usize, item: &CacheItem<V>) -> Result<()> {
        self.evict_below(level, item.key(), item.region()).await?;

        if self.configuration.update_mode() == UpdateMode::PropagateUpward {
            for handle in &self.handles[level + 1..] {
                handle.put(item.clone()).await?;
            }
        }
        Ok(())
    }

    async fn backfill(&self, level: usize, item: &CacheItem<V>) {
        for handle in &self.handles[..level] {
            let configuration = handle.configuration();
            let copy = item
                .clone()
                .apply_defaults(configuration.expiration_mode(), configuration.expiration_timeout());

            if let Err(e) = handle.add(copy).await {
                tracing::error!(
                    cache.name = self.configuration.name(),
                    cache.handle = configuration.name(),
                    cache.key = item.key(),
                    cache.region = item.region(),
                    error = %e,
                    "failed to back-fill handle"
                );
            }
        }
    }

    /// Handles that must drop what another process changed.
    ///
    /// A distributed source already reflects the change, a local one does not.
    fn eviction_targets(&self) -> impl Iterator<Item = &DynamicHandle<V>> {
        self.handles
            .iter()
            .filter(|handle| !handle.configuration().is_backplane_source() || !handle.is_distributed())
    }

    async fn drain(&self) -> usize {
        let _drain = self.queue.lock_drain().await;
        let mut processed = 0;

        while let Some(notification) = self.queue.pop() {
            if self.disposed.load(Ordering::SeqCst) {
                break;
            }

            match notification {
                Notification::Backplane(message) => self.apply_remote(&message).await,
                Notification::Removal { level, event } => self.apply_removal(level, &event).await,
            }
            processed += 1;
        }

        processed
    }

    async fn apply_remote(&self, message: &BackplaneMessage) {
        let region = message.region();
        let (eviction, event) = match (message.action(), message.key()) {
            (BackplaneAction::Changed(action), Some(key)) => {
                let key_owned = key.to_owned();
                let region = region.map(str::to_owned);
                let origin = EventOrigin::Remote;
                let event = match action {
                    ChangeAction::Add => CacheEvent::Add {
                        key: key_owned,
                        region,
                        origin,
                    },
                    ChangeAction::Put => CacheEvent::Put {
                        key: key_owned,
                        region,
                        origin,
                    },
                    ChangeAction::Update => CacheEvent::Update {
                        key: key_owned,
                        region,
                        origin,
                    },
                };
                (Eviction::Key(key, message.region()), event)
            }
            (BackplaneAction::Removed, Some(key)) => (
                Eviction::Key(key, region),
                CacheEvent::Remove {
                    key: key.to_owned(),
                    region: region.map(str::to_owned),
                    origin: EventOrigin::Remote,
                },
            ),
            (BackplaneAction::Clear, _) => (Eviction::All, CacheEvent::Clear { origin: EventOrigin::Remote }),
            (BackplaneAction::ClearRegion, _) => {
                let Some(region) = region else {
                    tracing::warn!(cache.name = self.configuration.name(), origin = %message.origin(), "region clear without region ignored");
                    return;
                };
                (
                    Eviction::Region(region),
                    CacheEvent::ClearRegion {
                        region: region.to_owned(),
                        origin: EventOrigin::Remote,
                    },
                )
            }
            (action, None) => {
                tracing::warn!(cache.name = self.configuration.name(), origin = %message.origin(), ?action, "backplane message without key ignored");
                return;
            }
        };

        tracing::info!(
            cache.name = self.configuration.name(),
            cache.key = message.key(),
            cache.region = region,
            origin = %message.origin(),
            action = ?message.action(),
            "evicting after remote change"
        );

        for handle in self.eviction_targets() {
            self.evict_with_retry(handle, &eviction).await;
        }

        self.events.notify(&event);
    }

    async fn apply_removal(&self, level: usize, event: &RemovalEvent) {
        let Some(handle) = self.handles.get(level) else {
            return;
        };

        tracing::debug!(
            cache.name = self.configuration.name(),
            cache.handle = handle.configuration().name(),
            cache.key = event.key.as_str(),
            cache.region = event.region.as_deref(),
            reason = %event.reason,
            "handle removed item"
        );

        if self.configuration.update_mode() == UpdateMode::PropagateUpward {
            let eviction = Eviction::Key(&event.key, event.region.as_deref());
            for nearer in &self.handles[..level] {
                self.evict_with_retry(nearer, &eviction).await;
            }
        }

        self.events.notify(&CacheEvent::RemoveByHandle {
            key: event.key.clone(),
            region: event.region.clone(),
            reason: event.reason,
            level,
        });

        if event.reason != RemovalReason::Evicted && handle.configuration().is_backplane_source() {
            if let Some(backplane) = &self.backplane {
                backplane.notify_remove(&event.key, event.region.as_deref());
            }
        }
    }

    async fn evict_with_retry(&self, handle: &DynamicHandle<V>, eviction: &Eviction<'_>) {
        let Err(e) = evict(handle, eviction).await else {
            return;
        };

        tracing::warn!(
            cache.name = self.configuration.name(),
            cache.handle = handle.configuration().name(),
            error = %e,
            "eviction failed, retrying"
        );
        self.clock.delay(self.configuration.retry_timeout()).await;

        if let Err(e) = evict(handle, eviction).await {
            tracing::error!(
                cache.name = self.configuration.name(),
                cache.handle = handle.configuration().name(),
                error = %e,
                "eviction failed after retry"
            );
        }
    }
}

async fn evict<V>(handle: &DynamicHandle<V>, eviction: &Eviction<'_>) -> Result<()>
where
    V: Send + Sync,
{
    match eviction {
        Eviction::Key(key, region) => handle.remove(key, *region).await.map(drop),
        Eviction::Region(region) => handle.clear_region(region).await,
        Eviction::All => handle.clear().await,
    }
}

async fn process_notifications<V>(manager: Weak<ManagerInner<V>>, queue: Arc<NotificationQueue>)
where
    V: Clone + Send + Sync + 'static,
{
    loop {
        queue.wait().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.drain().await;
    }
}

async fn run_factory<Fut, C, V>(factory: Fut, cancellation: C) -> Result<Option<V>>
where
    Fut: Future<Output = Option<V>>,
    C: Future<Output = ()>,
{
    let factory = pin!(factory);
    let cancellation = pin!(cancellation);

    match select(factory, cancellation).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(((), _)) => Err(Error::with_kind(ErrorKind::Cancelled)),
    }
}

fn swallow_give_up<V>(result: Result<CacheItem<V>>) -> Result<Option<CacheItem<V>>> {
    match result {
        Ok(item) => Ok(Some(item)),
        Err(e) if matches!(e.kind(), ErrorKind::FactoryReturnedNone | ErrorKind::RetriesExhausted) => Ok(None),
        Err(e) => Err(e),
    }
}

fn validate_key(key: &str, region: Option<&str>) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("cache key must not be empty"));
    }
    if region.is_some_and(str::is_empty) {
        return Err(Error::invalid_argument("region must not be empty when set"));
    }
    Ok(())
}
