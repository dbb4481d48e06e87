// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Distributed cache handle storing each item as a Redis hash.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use redis::{Client, IntoConnectionInfo, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};
use tick::Clock;
use tierlink_handle::{
    CacheHandle, CacheItem, Error, ErrorKind, ExpirationMode, HandleConfiguration, HandleStats, ObserverList, RemovalEvent,
    RemovalReason, Result, StatsCounter, UpdateFn, UpdateResult,
    retry::{Attempt, Outcome, retry_until_settled},
};
use tokio::task::JoinHandle;

use crate::{
    config::RedisConfiguration,
    keys::KeyCodec,
    notifications::{KeyspaceListener, NOTIFY_FLAGS},
    retry::{TransientRetry, to_error},
    scripts::{Script, ScriptSet},
    wire::{
        EncodedItem, FIELD_VALUE, FIELD_VERSION, READ_FIELDS, REGION_SENTINEL, StoredItem, decode_fields,
    },
};

const SCAN_PAGE_SIZE: usize = 500;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasOutcome {
    Written,
    Conflict,
    Missing,
}

struct Inner {
    client: Client,
    conn: ConnectionManager,
    scripts: ScriptSet,
    keys: KeyCodec,
    configuration: HandleConfiguration,
    redis: RedisConfiguration,
    stats: HandleStats,
    removals: Arc<ObserverList<RemovalEvent>>,
    region_keys: Arc<RwLock<HashSet<String>>>,
    retry: TransientRetry,
    clock: Clock,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// A distributed cache handle backed by Redis.
///
/// Each item is one Redis hash holding the JSON value, its expiration
/// settings, its creation time and a version used for optimistic updates.
/// Items in a region are also listed in a region lookup hash so the region can
/// be cleared without scanning the keyspace.
///
/// Writes go through server-side Lua scripts unless scripting is disabled in
/// [`RedisConfiguration`], in which case discrete commands and a `WATCH`
/// transaction provide the same semantics.
///
/// # Examples
///
/// ```no_run
/// use tick::Clock;
/// use tierlink_handle::{CacheHandle, CacheItem, HandleConfiguration};
/// use tierlink_redis::{RedisCacheHandle, RedisConfiguration};
///
/// # async fn example() -> Result<(), tierlink_handle::Error> {
/// let handle = RedisCacheHandle::<String>::connect(
///     HandleConfiguration::new("redis").with_backplane_source(true),
///     RedisConfiguration::new("redis://127.0.0.1:6379"),
///     Clock::new_tokio(),
/// )
/// .await?;
///
/// handle.put(CacheItem::new("greeting", "hello".to_string())?).await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisCacheHandle<V> {
    inner: Arc<Inner>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for RedisCacheHandle<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for RedisCacheHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheHandle")
            .field("name", &self.inner.configuration.name())
            .field("database", &self.inner.redis.database())
            .field("use_scripting", &self.inner.redis.use_scripting())
            .finish_non_exhaustive()
    }
}

impl<V> RedisCacheHandle<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Connects to Redis and prepares the handle.
    ///
    /// Loads the Lua scripts when scripting is enabled and starts the keyspace
    /// listener when notifications are enabled. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] for invalid settings and a store
    /// error if the server cannot be reached within the retry budget.
    pub async fn connect(configuration: HandleConfiguration, redis: RedisConfiguration, clock: Clock) -> Result<Self> {
        configuration.validate()?;
        redis.validate()?;

        let mut info = redis
            .connection_string()
            .into_connection_info()
            .map_err(|e| Error::with_cause(ErrorKind::Configuration, e))?;
        info.redis.db = i64::from(redis.database());

        let client = Client::open(info).map_err(|e| Error::with_cause(ErrorKind::Configuration, e))?;
        let retry = TransientRetry::new(clock.clone(), redis.retry_count(), redis.retry_timeout());
        let client_ref = &client;
        let conn = retry.run("connect", || client_ref.get_connection_manager()).await?;

        let scripts = ScriptSet::default();
        if redis.use_scripting() {
            let (conn, scripts) = (&conn, &scripts);
            retry
                .run("script load", || {
                    let mut conn = conn.clone();
                    async move { scripts.load_all(&mut conn).await }
                })
                .await?;
        }

        let inner = Arc::new(Inner {
            keys: KeyCodec::new(redis.key_prefix(), redis.keyspace_notifications()),
            stats: HandleStats::new(configuration.enable_statistics()),
            removals: Arc::new(ObserverList::new()),
            region_keys: Arc::new(RwLock::new(HashSet::new())),
            listener: Mutex::new(None),
            disposed: AtomicBool::new(false),
            client,
            conn,
            scripts,
            configuration,
            redis,
            retry,
            clock,
        });

        if inner.redis.keyspace_notifications() {
            Self::start_listener(&inner).await;
        }

        tracing::debug!(cache.name = inner.configuration.name(), database = inner.redis.database(), "redis handle connected");

        Ok(Self {
            inner,
            _value: PhantomData,
        })
    }

    async fn start_listener(inner: &Arc<Inner>) {
        let mut conn = inner.conn.clone();
        let configured: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(NOTIFY_FLAGS)
            .query_async(&mut conn)
            .await;
        if let Err(e) = configured {
            tracing::warn!(
                cache.name = inner.configuration.name(),
                error = %e,
                "could not enable keyspace notifications, relying on server configuration"
            );
        }

        let listener = KeyspaceListener {
            client: inner.client.clone(),
            database: inner.redis.database(),
            keys: inner.keys.clone(),
            region_keys: Arc::clone(&inner.region_keys),
            removals: Arc::clone(&inner.removals),
            handle_name: inner.configuration.name().to_owned(),
            clock: inner.clock.clone(),
        };
        *inner.listener.lock() = Some(tokio::spawn(listener.run()));
    }

    /// Returns the Redis settings of this handle.
    #[must_use]
    pub fn redis_configuration(&self) -> &RedisConfiguration {
        &self.inner.redis
    }

    fn prepare(&self, item: CacheItem<V>) -> CacheItem<V> {
        let now = self.inner.clock.system_time();
        item.apply_defaults(
            self.inner.configuration.expiration_mode(),
            self.inner.configuration.expiration_timeout(),
        )
        .ensure_created(now)
        .touched(now)
    }

    fn item_keys(&self, key: &str, region: Option<&str>) -> Vec<String> {
        let mut keys = vec![self.inner.keys.full_key(key, region)];
        if let Some(region) = region {
            let region_key = self.inner.keys.region_key(region);
            self.inner.region_keys.write().insert(region_key.clone());
            keys.push(region_key);
        }
        keys
    }

    async fn write(&self, script: Script, item: &CacheItem<V>) -> Result<i64> {
        let encoded = EncodedItem::encode(item, self.inner.clock.system_time())?;
        let keys = self.item_keys(item.key(), item.region());
        let inner = &*self.inner;

        if inner.redis.use_scripting() {
            let args = vec![
                encoded.value.clone(),
                encoded.value_type.to_owned(),
                encoded.expiration.to_string(),
                encoded.timeout_ms.to_string(),
                encoded.created_ticks.to_string(),
                encoded.default_expiration.to_owned(),
                encoded.ttl_ms.to_string(),
            ];
            let (keys, args) = (&keys, &args);
            return inner
                .retry
                .run("write", || {
                    let mut conn = inner.conn.clone();
                    async move { inner.scripts.run(&mut conn, script, keys, args).await }
                })
                .await;
        }

        let keys = &keys;
        let encoded = &encoded;
        inner
            .retry
            .run("write", || {
                let mut conn = inner.conn.clone();
                async move {
                    if script == Script::Add {
                        let stored: i64 = redis::cmd("HSETNX")
                            .arg(&keys[0])
                            .arg(FIELD_VALUE)
                            .arg(&encoded.value)
                            .query_async(&mut conn)
                            .await?;
                        if stored == 0 {
                            return Ok(0);
                        }
                    }

                    let mut pipe = redis::pipe();
                    pipe.atomic().cmd("HSET").arg(&keys[0]).arg(encoded.fields().to_vec()).ignore();
                    if script == Script::Add {
                        pipe.cmd("HSET").arg(&keys[0]).arg(FIELD_VERSION).arg(1).ignore();
                    } else {
                        pipe.cmd("HINCRBY").arg(&keys[0]).arg(FIELD_VERSION).arg(1);
                    }
                    if encoded.ttl_ms > 0 {
                        pipe.cmd("PEXPIRE").arg(&keys[0]).arg(encoded.ttl_ms).ignore();
                    } else {
                        pipe.cmd("PERSIST").arg(&keys[0]).ignore();
                    }
                    if let Some(region_key) = keys.get(1) {
                        pipe.cmd("HSET").arg(region_key).arg(&keys[0]).arg(REGION_SENTINEL).ignore();
                    }

                    let results: Vec<i64> = pipe.query_async(&mut conn).await?;
                    Ok(results.first().copied().unwrap_or(1))
                }
            })
            .await
    }

    async fn read(&self, key: &str, region: Option<&str>) -> Result<Option<StoredItem<V>>> {
        let inner = &*self.inner;
        let full_key = inner.keys.full_key(key, region);

        let fields: Vec<Option<String>> = if inner.redis.use_scripting() {
            let keys = vec![full_key.clone()];
            let keys = &keys;
            inner
                .retry
                .run("read", || {
                    let mut conn = inner.conn.clone();
                    async move { inner.scripts.run(&mut conn, Script::Get, keys, &[]).await }
                })
                .await?
        } else {
            let full_key = &full_key;
            inner
                .retry
                .run("read", || {
                    let mut conn = inner.conn.clone();
                    async move { redis::cmd("HMGET").arg(full_key).arg(&READ_FIELDS[..]).query_async(&mut conn).await }
                })
                .await?
        };

        let now = inner.clock.system_time();
        let Some(stored) = decode_fields::<V>(key, region, &fields, now)? else {
            return Ok(None);
        };

        if stored.item.is_expired_at(now) {
            self.delete(key, region).await?;
            tracing::debug!(cache.name = inner.configuration.name(), cache.key = key, cache.region = region, "expired item removed");
            inner.removals.notify(&RemovalEvent::new(key, region, RemovalReason::Expired));
            return Ok(None);
        }

        if !inner.redis.use_scripting() && stored.item.expiration_mode() == ExpirationMode::Sliding {
            let ttl = millis(stored.item.expiration_timeout());
            let full_key = &full_key;
            inner
                .retry
                .run("renew", || {
                    let mut conn = inner.conn.clone();
                    async move { redis::cmd("PEXPIRE").arg(full_key).arg(ttl).query_async::<()>(&mut conn).await }
                })
                .await?;
        }

        Ok(Some(stored))
    }

    async fn delete(&self, key: &str, region: Option<&str>) -> Result<bool> {
        let inner = &*self.inner;
        let full_key = inner.keys.full_key(key, region);
        let region_key = region.map(|region| inner.keys.region_key(region));
        let (full_key, region_key) = (&full_key, &region_key);

        let results: Vec<i64> = inner
            .retry
            .run("remove", || {
                let mut conn = inner.conn.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().cmd("DEL").arg(full_key);
                    if let Some(region_key) = region_key {
                        pipe.cmd("HDEL").arg(region_key).arg(full_key).ignore();
                    }
                    pipe.query_async(&mut conn).await
                }
            })
            .await?;

        Ok(results.first().is_some_and(|deleted| *deleted > 0))
    }

    /// Deletes every key matching `pattern`, one `SCAN` page at a time.
    async fn delete_matching(&self, pattern: &str) -> Result<()> {
        let inner = &*self.inner;
        let mut cursor = 0_u64;
        loop {
            let (next, keys): (u64, Vec<String>) = inner
                .retry
                .run("clear", || {
                    let mut conn = inner.conn.clone();
                    async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(pattern)
                            .arg("COUNT")
                            .arg(SCAN_PAGE_SIZE)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;

            if !keys.is_empty() {
                let keys = &keys;
                inner
                    .retry
                    .run("clear", || {
                        let mut conn = inner.conn.clone();
                        async move { redis::cmd("UNLINK").arg(keys).query_async::<()>(&mut conn).await }
                    })
                    .await?;
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    async fn compare_and_set(&self, full_key: &str, stored: &StoredItem<V>, new_value: String) -> Result<CasOutcome> {
        let inner = &*self.inner;
        let sliding_ttl = if stored.item.expiration_mode() == ExpirationMode::Sliding {
            millis(stored.item.expiration_timeout())
        } else {
            0
        };

        if inner.redis.use_scripting() {
            let keys = vec![full_key.to_owned()];
            let args = vec![new_value, stored.version.to_string(), sliding_ttl.to_string()];
            let (keys, args) = (&keys, &args);
            let written: Option<i64> = inner
                .retry
                .run("update", || {
                    let mut conn = inner.conn.clone();
                    async move { inner.scripts.run(&mut conn, Script::Update, keys, args).await }
                })
                .await?;

            return Ok(match written {
                None => CasOutcome::Conflict,
                Some(-1) => CasOutcome::Missing,
                Some(_) => CasOutcome::Written,
            });
        }

        let client = inner.client.clone();
        let full_key = full_key.to_owned();
        let expected = stored.raw_value.clone();
        tokio::task::spawn_blocking(move || watch_and_set(&client, &full_key, &expected, &new_value, sliding_ttl))
            .await
            .map_err(|e| Error::with_cause(ErrorKind::Store, e))?
            .map_err(to_error)
    }
}

/// Conditional write on a dedicated connection, aborted if `value` changed since it was read.
fn watch_and_set(
    client: &Client,
    full_key: &str,
    expected: &str,
    new_value: &str,
    sliding_ttl: u64,
) -> redis::RedisResult<CasOutcome> {
    let mut conn = client.get_connection()?;

    let mut outcome = CasOutcome::Written;
    let _: () = redis::transaction(&mut conn, &[full_key], |conn, pipe| {
        let current: Option<String> = redis::cmd("HGET").arg(full_key).arg(FIELD_VALUE).query(conn)?;
        match current {
            None => {
                outcome = CasOutcome::Missing;
                Ok(Some(()))
            }
            Some(current) if current != expected => {
                outcome = CasOutcome::Conflict;
                Ok(Some(()))
            }
            Some(_) => {
                pipe.cmd("HSET").arg(full_key).arg(FIELD_VALUE).arg(new_value).ignore();
                pipe.cmd("HINCRBY").arg(full_key).arg(FIELD_VERSION).arg(1).ignore();
                if sliding_ttl > 0 {
                    pipe.cmd("PEXPIRE").arg(full_key).arg(sliding_ttl).ignore();
                }
                let committed: Option<()> = pipe.query(conn)?;
                if committed.is_none() {
                    // The watched key moved between the read and EXEC.
                    outcome = CasOutcome::Conflict;
                }
                Ok(Some(()))
            }
        }
    })?;

    Ok(outcome)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<V> CacheHandle<V> for RedisCacheHandle<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn configuration(&self) -> &HandleConfiguration {
        &self.inner.configuration
    }

    fn stats(&self) -> &HandleStats {
        &self.inner.stats
    }

    fn removals(&self) -> &ObserverList<RemovalEvent> {
        &self.inner.removals
    }

    fn is_distributed(&self) -> bool {
        true
    }

    async fn add(&self, item: CacheItem<V>) -> Result<bool> {
        self.inner.stats.record(StatsCounter::Add);
        let item = self.prepare(item);
        Ok(self.write(Script::Add, &item).await? == 1)
    }

    async fn put(&self, item: CacheItem<V>) -> Result<()> {
        self.inner.stats.record(StatsCounter::Put);
        let item = self.prepare(item);
        self.write(Script::Put, &item).await?;
        Ok(())
    }

    async fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<V>>> {
        self.inner.stats.record(StatsCounter::Get);
        Ok(self.read(key, region).await?.map(|stored| stored.item))
    }

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool> {
        let inner = &*self.inner;
        let full_key = inner.keys.full_key(key, region);
        let full_key = &full_key;
        inner
            .retry
            .run("exists", || {
                let mut conn = inner.conn.clone();
                async move { redis::cmd("EXISTS").arg(full_key).query_async(&mut conn).await }
            })
            .await
    }

    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool> {
        self.inner.stats.record(StatsCounter::Remove);
        self.delete(key, region).await
    }

    /// Removes every item of this handle.
    ///
    /// Without a key prefix the handle owns the database and runs `FLUSHDB`.
    /// With a prefix only keys under it are scanned and deleted, so other
    /// tenants of the database are left alone.
    async fn clear(&self) -> Result<()> {
        self.inner.stats.record(StatsCounter::Clear);
        let inner = &*self.inner;
        match inner.keys.scan_pattern() {
            None => {
                inner
                    .retry
                    .run("clear", || {
                        let mut conn = inner.conn.clone();
                        async move { redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await }
                    })
                    .await?;
            }
            Some(pattern) => self.delete_matching(&pattern).await?,
        }
        inner.region_keys.write().clear();
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> Result<()> {
        self.inner.stats.record(StatsCounter::ClearRegion);
        let inner = &*self.inner;
        let region_key = inner.keys.region_key(region);
        let region_key = &region_key;

        let fields: HashMap<String, String> = inner
            .retry
            .run("clear region", || {
                let mut conn = inner.conn.clone();
                async move { redis::cmd("HGETALL").arg(region_key).query_async(&mut conn).await }
            })
            .await?;

        let members = inner.keys.region_members(region, fields);
        if members.is_empty() {
            return Ok(());
        }

        // HDEL rather than DEL: the hash may also hold an item under the region's name.
        let members = &members;
        inner
            .retry
            .run("clear region", || {
                let mut conn = inner.conn.clone();
                async move {
                    let mut pipe = redis::pipe();
                    for member in members {
                        pipe.cmd("DEL").arg(member).ignore();
                    }
                    pipe.cmd("HDEL").arg(region_key).arg(members).ignore();
                    pipe.query_async::<()>(&mut conn).await
                }
            })
            .await?;

        tracing::debug!(cache.name = inner.configuration.name(), cache.region = region, removed = members.len(), "region cleared");
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        update_fn: UpdateFn<V>,
        max_retries: u32,
    ) -> Result<UpdateResult<V>> {
        self.inner.stats.record(StatsCounter::Update);
        let full_key = self.inner.keys.full_key(key, region);
        let (full_key, update_fn) = (&full_key, &update_fn);

        let outcome = retry_until_settled(max_retries.max(1), |attempt| async move {
            let Some(stored) = self.read(key, region).await? else {
                return Ok::<_, Error>(Attempt::Settled(UpdateResult::ItemDidNotExist));
            };
            let Some(value) = update_fn(stored.item.value()) else {
                return Ok(Attempt::Settled(UpdateResult::FactoryReturnedNone));
            };

            let raw = serde_json::to_string(&value).map_err(|e| Error::with_cause(ErrorKind::Serialization, e))?;
            Ok(match self.compare_and_set(full_key, &stored, raw).await? {
                CasOutcome::Written => {
                    let item = stored.item.with_value(value).touched(self.inner.clock.system_time());
                    Attempt::Settled(UpdateResult::success(item, attempt))
                }
                CasOutcome::Missing => Attempt::Settled(UpdateResult::ItemDidNotExist),
                CasOutcome::Conflict => {
                    tracing::debug!(cache.name = self.inner.configuration.name(), cache.key = key, attempt, "update lost a version race");
                    Attempt::Retry
                }
            })
        })
        .await?;

        Ok(match outcome {
            Outcome::Settled { value, .. } => value,
            Outcome::Exhausted { attempts } => {
                tracing::warn!(cache.name = self.inner.configuration.name(), cache.key = key, attempts, "update gave up after repeated conflicts");
                UpdateResult::TooManyRetries { attempts }
            }
        })
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.inner.removals.clear();
    }
}
