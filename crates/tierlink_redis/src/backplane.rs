// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pub/sub backplane that batches change notifications.
//!
//! Notify calls only append to a bounded, deduplicating buffer. A debounced
//! flush task and a periodic safety flush drain the buffer into one encoded
//! payload per chunk. A single receive task decodes incoming payloads, drops
//! the ones this instance sent and hands the rest to subscribers in order.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use parking_lot::Mutex;
use tick::{Clock, PeriodicTimer};
use tierlink_handle::{
    BackplaneAction, BackplaneMessage, CacheBackplane, ChangeAction, Error, ErrorKind, ObserverList, OriginId, Result,
};
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    codec::{self, MAX_CHUNK_BYTES},
    config::BackplaneConfiguration,
    transport::{BackplaneTransport, RedisTransport},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Pending {
    order: Vec<BackplaneMessage>,
    seen: HashSet<BackplaneMessage>,
}

impl Pending {
    fn take(&mut self) -> Vec<BackplaneMessage> {
        self.seen.clear();
        std::mem::take(&mut self.order)
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    chunks: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

struct Shared<T> {
    origin: OriginId,
    transport: T,
    configuration: BackplaneConfiguration,
    clock: Clock,
    runtime: Handle,
    pending: Mutex<Pending>,
    sending: AtomicBool,
    disposed: AtomicBool,
    messages: ObserverList<BackplaneMessage>,
    counters: Counters,
}

impl<T: BackplaneTransport> Shared<T> {
    fn enqueue(self: &Arc<Self>, message: BackplaneMessage) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        {
            let mut pending = self.pending.lock();
            if message.action() == BackplaneAction::Clear {
                pending.take();
            }

            if pending.seen.contains(&message) {
                return;
            }

            if pending.order.len() >= self.configuration.capacity() {
                drop(pending);
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    channel = self.configuration.channel_name(),
                    capacity = self.configuration.capacity(),
                    dropped,
                    "backplane buffer full, dropping message"
                );
                return;
            }

            pending.seen.insert(message.clone());
            pending.order.push(message);
        }

        self.schedule_flush();
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.sending.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            shared.clock.delay(shared.configuration.debounce()).await;
            shared.sending.store(false, Ordering::Release);
            shared.flush().await;
        });
    }

    async fn flush(&self) {
        let batch = self.pending.lock().take();
        if batch.is_empty() {
            return;
        }

        let chunks = codec::encode(self.origin, &batch, MAX_CHUNK_BYTES);
        let chunk_count = chunks.len();
        for chunk in chunks {
            if let Err(e) = self.transport.publish(chunk).await {
                tracing::error!(channel = self.configuration.channel_name(), error = %e, "failed to publish backplane messages");
                return;
            }
            self.counters.chunks.fetch_add(1, Ordering::Relaxed);
        }

        self.counters.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            channel = self.configuration.channel_name(),
            messages = batch.len(),
            chunks = chunk_count,
            "flushed backplane messages"
        );
    }

    fn deliver(&self, payload: &[u8]) {
        let (origin, messages) = match codec::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(channel = self.configuration.channel_name(), error = %e, "failed to decode backplane payload");
                return;
            }
        };

        if origin == self.origin || self.disposed.load(Ordering::Acquire) {
            return;
        }

        self.counters.received.fetch_add(messages.len() as u64, Ordering::Relaxed);
        for message in &messages {
            self.messages.notify(message);
        }
    }

    async fn receive(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.transport.subscribe().await {
                Ok(mut payloads) => {
                    backoff = INITIAL_BACKOFF;
                    while let Some(payload) = payloads.next().await {
                        self.deliver(&payload);
                    }
                    tracing::warn!(channel = self.configuration.channel_name(), "backplane subscription ended, reconnecting");
                }
                Err(e) => {
                    tracing::error!(
                        channel = self.configuration.channel_name(),
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "backplane subscription failed"
                    );
                }
            }

            self.clock.delay(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn flush_periodically(self: Arc<Self>) {
        let mut timer = PeriodicTimer::new(&self.clock, self.configuration.flush_interval());
        while timer.next().await.is_some() {
            self.flush().await;
        }
    }
}

/// A [`CacheBackplane`] over a pub/sub channel.
///
/// Every instance gets a random [`OriginId`]. Payloads carrying it are
/// ignored on receipt, so an instance never evicts because of its own writes.
///
/// # Examples
///
/// ```no_run
/// use tick::Clock;
/// use tierlink_handle::{CacheBackplane, ChangeAction};
/// use tierlink_redis::{BackplaneConfiguration, RedisCacheBackplane};
///
/// # async fn example() -> Result<(), tierlink_handle::Error> {
/// let backplane =
///     RedisCacheBackplane::connect("redis://127.0.0.1:6379", BackplaneConfiguration::default(), Clock::new_tokio())
///         .await?;
///
/// backplane.notify_change("key", None, ChangeAction::Put);
/// backplane.flush().await;
/// # Ok(())
/// # }
/// ```
pub struct RedisCacheBackplane<T: BackplaneTransport = RedisTransport> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: BackplaneTransport> fmt::Debug for RedisCacheBackplane<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheBackplane")
            .field("origin", &self.shared.origin)
            .field("channel", &self.shared.configuration.channel_name())
            .finish_non_exhaustive()
    }
}

impl RedisCacheBackplane<RedisTransport> {
    /// Connects to Redis and starts the backplane tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] for invalid settings or when called
    /// outside a Tokio runtime, and a store error if Redis cannot be reached.
    pub async fn connect(connection_string: &str, configuration: BackplaneConfiguration, clock: Clock) -> Result<Self> {
        configuration.validate()?;
        let transport = RedisTransport::connect(connection_string, configuration.channel_name()).await?;
        Self::with_transport(configuration, transport, clock)
    }
}

impl<T: BackplaneTransport> RedisCacheBackplane<T> {
    /// Starts a backplane over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] for invalid settings or when called
    /// outside a Tokio runtime.
    pub fn with_transport(configuration: BackplaneConfiguration, transport: T, clock: Clock) -> Result<Self> {
        configuration.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::with_cause(ErrorKind::Configuration, e))?;

        let shared = Arc::new(Shared {
            origin: OriginId::from_bytes(*uuid::Uuid::new_v4().as_bytes()),
            transport,
            configuration,
            clock,
            runtime: runtime.clone(),
            pending: Mutex::new(Pending::default()),
            sending: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            messages: ObserverList::new(),
            counters: Counters::default(),
        });

        let tasks = vec![
            runtime.spawn(Arc::clone(&shared).receive()),
            runtime.spawn(Arc::clone(&shared).flush_periodically()),
        ];

        tracing::debug!(origin = %shared.origin, channel = shared.configuration.channel_name(), "backplane started");

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Publishes everything buffered right away.
    pub async fn flush(&self) {
        self.shared.flush().await;
    }

    /// Returns the number of messages waiting for the next flush.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.shared.pending.lock().order.len()
    }

    /// Returns how many messages were published.
    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.shared.counters.sent.load(Ordering::Relaxed)
    }

    /// Returns how many payloads were published.
    #[must_use]
    pub fn chunks_sent(&self) -> u64 {
        self.shared.counters.chunks.load(Ordering::Relaxed)
    }

    /// Returns how many messages from other instances were delivered.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.shared.counters.received.load(Ordering::Relaxed)
    }

    /// Returns how many messages were dropped because the buffer was full.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.shared.counters.dropped.load(Ordering::Relaxed)
    }

    /// Returns the backplane settings.
    #[must_use]
    pub fn configuration(&self) -> &BackplaneConfiguration {
        &self.shared.configuration
    }
}

impl<T: BackplaneTransport> CacheBackplane for RedisCacheBackplane<T> {
    fn identifier(&self) -> OriginId {
        self.shared.origin
    }

    fn notify_change(&self, key: &str, region: Option<&str>, action: ChangeAction) {
        self.shared
            .enqueue(BackplaneMessage::changed(self.shared.origin, key, region, action));
    }

    fn notify_remove(&self, key: &str, region: Option<&str>) {
        self.shared.enqueue(BackplaneMessage::removed(self.shared.origin, key, region));
    }

    fn notify_clear(&self) {
        self.shared.enqueue(BackplaneMessage::clear(self.shared.origin));
    }

    fn notify_clear_region(&self, region: &str) {
        self.shared.enqueue(BackplaneMessage::clear_region(self.shared.origin, region));
    }

    fn messages(&self) -> &ObserverList<BackplaneMessage> {
        &self.shared.messages
    }

    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.messages.clear();
        tracing::debug!(origin = %self.shared.origin, "backplane disposed");
    }
}

impl<T: BackplaneTransport> Drop for RedisCacheBackplane<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
