// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for handles and backplanes.
//!
//! [`MockHandle`] is a configurable in-memory handle that records every
//! operation and supports failure injection and forced version conflicts.
//! [`BackplaneHub`] connects several [`InProcessBackplane`]s inside one process.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tick::Clock;

use crate::{
    BackplaneMessage, CacheBackplane, CacheHandle, CacheItem, ChangeAction, Error, ErrorKind, HandleConfiguration, HandleStats,
    ObserverList, OriginId, RemovalEvent, RemovalReason, Result, StatsCounter, UpdateFn, UpdateResult,
};

/// A recorded handle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOp {
    /// `add` was called.
    Add {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// `put` was called.
    Put {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// `get` was called.
    Get {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// `exists` was called.
    Exists {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// `remove` was called.
    Remove {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// `update` was called.
    Update {
        /// The key.
        key: String,
        /// The region.
        region: Option<String>,
    },
    /// `clear` was called.
    Clear,
    /// `clear_region` was called with the given region.
    ClearRegion(String),
}

impl HandleOp {
    /// Returns the key the operation targeted, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Add { key, .. }
            | Self::Put { key, .. }
            | Self::Get { key, .. }
            | Self::Exists { key, .. }
            | Self::Remove { key, .. }
            | Self::Update { key, .. } => Some(key),
            Self::Clear | Self::ClearRegion(_) => None,
        }
    }
}

fn owned(region: Option<&str>) -> Option<String> {
    region.map(str::to_owned)
}

type FailPredicate = Box<dyn Fn(&HandleOp) -> bool + Send + Sync>;
type SlotKey = (String, Option<String>);

struct Slot<V> {
    item: CacheItem<V>,
    version: u64,
}

struct MockState<V> {
    configuration: HandleConfiguration,
    stats: HandleStats,
    removals: ObserverList<RemovalEvent>,
    clock: Clock,
    distributed: AtomicBool,
    disposed: AtomicBool,
    forced_conflicts: AtomicU32,
    data: Mutex<HashMap<SlotKey, Slot<V>>>,
    operations: Mutex<Vec<HandleOp>>,
    fail_when: Mutex<Option<FailPredicate>>,
}

/// A configurable mock handle for testing.
///
/// Clones share state, so a test can keep one clone for inspection while the
/// manager owns another.
///
/// # Examples
///
/// ```
/// use tierlink_handle::{CacheHandle, CacheItem, testing::{HandleOp, MockHandle}};
///
/// # futures::executor::block_on(async {
/// let handle = MockHandle::<i32>::new("mock");
/// handle.put(CacheItem::new("k", 1)?).await?;
/// assert_eq!(*handle.get("k", None).await?.unwrap().value(), 1);
///
/// handle.fail_when(|op| matches!(op, HandleOp::Get { .. }));
/// assert!(handle.get("k", None).await.is_err());
/// # Ok::<(), tierlink_handle::Error>(())
/// # });
/// ```
pub struct MockHandle<V> {
    state: Arc<MockState<V>>,
}

impl<V> Clone for MockHandle<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V> Debug for MockHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle")
            .field("name", &self.state.configuration.name())
            .field("entries", &self.state.data.lock().len())
            .field("fail_when", &self.state.fail_when.lock().is_some())
            .finish()
    }
}

impl<V> MockHandle<V> {
    /// Creates an empty mock handle with a frozen clock and no default expiration.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_configuration(HandleConfiguration::new(name), Clock::new_frozen())
    }

    /// Creates an empty mock handle with explicit configuration and clock.
    #[must_use]
    pub fn with_configuration(configuration: HandleConfiguration, clock: Clock) -> Self {
        Self {
            state: Arc::new(MockState {
                stats: HandleStats::new(configuration.enable_statistics()),
                configuration,
                removals: ObserverList::new(),
                clock,
                distributed: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                forced_conflicts: AtomicU32::new(0),
                data: Mutex::new(HashMap::new()),
                operations: Mutex::new(Vec::new()),
                fail_when: Mutex::new(None),
            }),
        }
    }

    /// Makes the handle report itself as distributed.
    pub fn set_distributed(&self, distributed: bool) {
        self.state.distributed.store(distributed, Ordering::Relaxed);
    }

    /// Sets a predicate that determines which operations fail with a store error.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&HandleOp) -> bool + Send + Sync + 'static,
    {
        *self.state.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate.
    pub fn clear_failures(&self) {
        *self.state.fail_when.lock() = None;
    }

    /// Makes the next `count` update attempts lose their version race.
    pub fn force_conflicts(&self, count: u32) {
        self.state.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Returns a copy of the recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<HandleOp> {
        self.state.operations.lock().clone()
    }

    /// Clears the recorded operations.
    pub fn clear_operations(&self) {
        self.state.operations.lock().clear();
    }

    /// Returns the number of stored items, expired or not.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.state.data.lock().len()
    }

    /// Returns `true` if an item is stored under the key, without recording an operation.
    #[must_use]
    pub fn contains(&self, key: &str, region: Option<&str>) -> bool {
        self.state.data.lock().contains_key(&(key.to_owned(), owned(region)))
    }

    /// Returns `true` once [`CacheHandle::dispose`] was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Drops an item as if the store had removed it on its own, and notifies observers.
    pub fn emit_removal(&self, key: &str, region: Option<&str>, reason: RemovalReason) {
        self.state.data.lock().remove(&(key.to_owned(), owned(region)));
        self.state.removals.notify(&RemovalEvent::new(key, region, reason));
    }

    fn begin(&self, op: HandleOp) -> Result<()> {
        let fail = self.state.fail_when.lock().as_ref().is_some_and(|predicate| predicate(&op));
        self.state.operations.lock().push(op);
        if fail {
            return Err(Error::with_cause(ErrorKind::Store, "mock: operation failed"));
        }
        Ok(())
    }

    fn prepare(&self, item: CacheItem<V>) -> CacheItem<V> {
        let now = self.state.clock.system_time();
        item.apply_defaults(
            self.state.configuration.expiration_mode(),
            self.state.configuration.expiration_timeout(),
        )
        .ensure_created(now)
        .touched(now)
    }
}

impl<V> MockHandle<V>
where
    V: Clone,
{
    /// Returns a copy of the stored item without recording an operation or touching it.
    #[must_use]
    pub fn peek(&self, key: &str, region: Option<&str>) -> Option<CacheItem<V>> {
        self.state
            .data
            .lock()
            .get(&(key.to_owned(), owned(region)))
            .map(|slot| slot.item.clone())
    }

    fn live(&self, key: &str, region: Option<&str>) -> Option<(CacheItem<V>, u64)> {
        let slot_key = (key.to_owned(), owned(region));
        let now = self.state.clock.system_time();
        let mut data = self.state.data.lock();
        let expired = data.get(&slot_key).is_some_and(|slot| slot.item.is_expired_at(now));
        if expired {
            data.remove(&slot_key);
            drop(data);
            self.state
                .removals
                .notify(&RemovalEvent::new(key, region, RemovalReason::Expired));
            return None;
        }

        data.get(&slot_key).map(|slot| (slot.item.clone(), slot.version))
    }
}

impl<V> CacheHandle<V> for MockHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn configuration(&self) -> &HandleConfiguration {
        &self.state.configuration
    }

    fn stats(&self) -> &HandleStats {
        &self.state.stats
    }

    fn removals(&self) -> &ObserverList<RemovalEvent> {
        &self.state.removals
    }

    fn is_distributed(&self) -> bool {
        self.state.distributed.load(Ordering::Relaxed)
    }

    fn count(&self) -> Option<u64> {
        u64::try_from(self.entry_count()).ok()
    }

    async fn add(&self, item: CacheItem<V>) -> Result<bool> {
        self.begin(HandleOp::Add {
            key: item.key().to_owned(),
            region: owned(item.region()),
        })?;
        self.state.stats.record(StatsCounter::Add);

        if self.live(item.key(), item.region()).is_some() {
            return Ok(false);
        }

        let item = self.prepare(item);
        let slot_key = (item.key().to_owned(), owned(item.region()));
        let mut data = self.state.data.lock();
        if data.contains_key(&slot_key) {
            return Ok(false);
        }
        data.insert(slot_key, Slot { item, version: 1 });
        Ok(true)
    }

    async fn put(&self, item: CacheItem<V>) -> Result<()> {
        self.begin(HandleOp::Put {
            key: item.key().to_owned(),
            region: owned(item.region()),
        })?;
        self.state.stats.record(StatsCounter::Put);

        let item = self.prepare(item);
        let slot_key = (item.key().to_owned(), owned(item.region()));
        let mut data = self.state.data.lock();
        let version = data.get(&slot_key).map_or(1, |slot| slot.version + 1);
        data.insert(slot_key, Slot { item, version });
        Ok(())
    }

    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<V>>> {
        self.begin(HandleOp::Get {
            key: key.to_owned(),
            region: owned(region),
        })?;
        self.state.stats.record(StatsCounter::Get);

        let Some((item, _)) = self.live(key, region) else {
            return Ok(None);
        };

        let item = item.touched(self.state.clock.system_time());
        if let Some(slot) = self.state.data.lock().get_mut(&(key.to_owned(), owned(region))) {
            slot.item = item.clone();
        }
        Ok(Some(item))
    }

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.begin(HandleOp::Exists {
            key: key.to_owned(),
            region: owned(region),
        })?;
        Ok(self.live(key, region).is_some())
    }

    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.begin(HandleOp::Remove {
            key: key.to_owned(),
            region: owned(region),
        })?;
        self.state.stats.record(StatsCounter::Remove);
        Ok(self.state.data.lock().remove(&(key.to_owned(), owned(region))).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.begin(HandleOp::Clear)?;
        self.state.stats.record(StatsCounter::Clear);
        self.state.data.lock().clear();
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> Result<()> {
        self.begin(HandleOp::ClearRegion(region.to_owned()))?;
        self.state.stats.record(StatsCounter::ClearRegion);
        self.state
            .data
            .lock()
            .retain(|(_, item_region), _| item_region.as_deref() != Some(region));
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> Result<UpdateResult<V>> {
        self.begin(HandleOp::Update {
            key: key.to_owned(),
            region: owned(region),
        })?;
        self.state.stats.record(StatsCounter::Update);

        let max_attempts = max_retries.max(1);
        for attempt in 1..=max_attempts {
            let Some((current, version)) = self.live(key, region) else {
                return Ok(UpdateResult::ItemDidNotExist);
            };

            let Some(value) = update_fn(current.value()) else {
                return Ok(UpdateResult::FactoryReturnedNone);
            };

            let forced = self
                .state
                .forced_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if forced {
                continue;
            }

            let mut data = self.state.data.lock();
            let Some(slot) = data.get_mut(&(key.to_owned(), owned(region))) else {
                return Ok(UpdateResult::ItemDidNotExist);
            };
            if slot.version != version {
                continue;
            }

            let item = current.with_value(value).touched(self.state.clock.system_time());
            slot.item = item.clone();
            slot.version += 1;
            return Ok(UpdateResult::success(item, attempt));
        }

        Ok(UpdateResult::TooManyRetries { attempts: max_attempts })
    }

    fn dispose(&self) {
        self.state.disposed.store(true, Ordering::SeqCst);
    }
}

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

fn next_origin() -> OriginId {
    let mut bytes = [0_u8; 16];
    bytes[..8].copy_from_slice(&NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    bytes[8..].copy_from_slice(b"in-proc!");
    OriginId::from_bytes(bytes)
}

struct Member {
    id: OriginId,
    messages: ObserverList<BackplaneMessage>,
    sent: Mutex<Vec<BackplaneMessage>>,
    disposed: AtomicBool,
}

impl Member {
    fn receive(&self, message: &BackplaneMessage) {
        if message.origin() == self.id || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.messages.notify(message);
    }
}

/// Connects in-process backplanes so that what one sends, the others receive.
///
/// Delivery is synchronous: a notify call returns after every other member's
/// observers have run.
#[derive(Clone, Default)]
pub struct BackplaneHub {
    members: Arc<Mutex<Vec<Weak<Member>>>>,
}

impl Debug for BackplaneHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackplaneHub")
            .field("members", &self.members.lock().len())
            .finish()
    }
}

impl BackplaneHub {
    /// Creates a hub without members.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backplane connected to this hub.
    #[must_use]
    pub fn connect(&self) -> InProcessBackplane {
        let member = Arc::new(Member {
            id: next_origin(),
            messages: ObserverList::new(),
            sent: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        self.members.lock().push(Arc::downgrade(&member));
        InProcessBackplane {
            member,
            hub: self.clone(),
        }
    }

    fn broadcast(&self, message: &BackplaneMessage) {
        let members: Vec<Arc<Member>> = {
            let mut members = self.members.lock();
            members.retain(|member| member.strong_count() > 0);
            members.iter().filter_map(Weak::upgrade).collect()
        };

        for member in members {
            member.receive(message);
        }
    }
}

/// A backplane that delivers through a [`BackplaneHub`].
#[derive(Clone)]
pub struct InProcessBackplane {
    member: Arc<Member>,
    hub: BackplaneHub,
}

impl Debug for InProcessBackplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackplane").field("id", &self.member.id).finish()
    }
}

impl InProcessBackplane {
    /// Returns every message this backplane has sent.
    #[must_use]
    pub fn sent(&self) -> Vec<BackplaneMessage> {
        self.member.sent.lock().clone()
    }

    /// Delivers `message` to this backplane as if it came from the hub.
    ///
    /// Messages carrying this backplane's own origin are discarded.
    pub fn inject(&self, message: &BackplaneMessage) {
        self.member.receive(message);
    }

    /// Returns `true` once [`CacheBackplane::dispose`] was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.member.disposed.load(Ordering::SeqCst)
    }

    fn send(&self, message: BackplaneMessage) {
        if self.is_disposed() {
            return;
        }
        self.member.sent.lock().push(message.clone());
        self.hub.broadcast(&message);
    }
}

impl CacheBackplane for InProcessBackplane {
    fn identifier(&self) -> OriginId {
        self.member.id
    }

    fn notify_change(&self, key: &str, region: Option<&str>, action: ChangeAction) {
        self.send(BackplaneMessage::changed(self.member.id, key, region, action));
    }

    fn notify_remove(&self, key: &str, region: Option<&str>) {
        self.send(BackplaneMessage::removed(self.member.id, key, region));
    }

    fn notify_clear(&self) {
        self.send(BackplaneMessage::clear(self.member.id));
    }

    fn notify_clear_region(&self, region: &str) {
        self.send(BackplaneMessage::clear_region(self.member.id, region));
    }

    fn messages(&self) -> &ObserverList<BackplaneMessage> {
        &self.member.messages
    }

    fn dispose(&self) {
        self.member.disposed.store(true, Ordering::SeqCst);
        self.member.messages.clear();
    }
}
