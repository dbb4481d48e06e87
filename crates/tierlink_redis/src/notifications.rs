// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Keyspace event listener reporting server-side removals.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::RwLock;
use redis::{Client, RedisResult};
use tick::Clock;
use tierlink_handle::{ObserverList, RemovalEvent, RemovalReason};

use crate::keys::KeyCodec;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Keyspace events delivered to the listener: keyevent class, generic, expired and evicted.
pub(crate) const NOTIFY_FLAGS: &str = "Egxe";

/// Everything the listener task needs, shared with the owning handle.
pub(crate) struct KeyspaceListener {
    pub(crate) client: Client,
    pub(crate) database: u32,
    pub(crate) keys: KeyCodec,
    pub(crate) region_keys: Arc<RwLock<HashSet<String>>>,
    pub(crate) removals: Arc<ObserverList<RemovalEvent>>,
    pub(crate) handle_name: String,
    pub(crate) clock: Clock,
}

impl KeyspaceListener {
    fn channels(&self) -> [String; 3] {
        ["expired", "evicted", "del"].map(|event| format!("__keyevent@{}__:{event}", self.database))
    }

    /// Listens until the task is aborted, reconnecting with exponential backoff.
    pub(crate) async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.listen().await {
                Ok(()) => {
                    tracing::warn!(cache.name = %self.handle_name, "keyspace notification stream ended, reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    tracing::error!(
                        cache.name = %self.handle_name,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "keyspace notification listener failed"
                    );
                }
            }

            self.clock.delay(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn listen(&self) -> RedisResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in self.channels() {
            pubsub.subscribe(channel).await?;
        }

        tracing::debug!(cache.name = %self.handle_name, "subscribed to keyspace notifications");

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let raw_key: String = match message.get_payload() {
                Ok(raw_key) => raw_key,
                Err(e) => {
                    tracing::warn!(cache.name = %self.handle_name, error = %e, "undecodable keyspace notification");
                    continue;
                }
            };

            if let Some(event) = self.decode(message.get_channel_name(), &raw_key) {
                self.removals.notify(&event);
            }
        }

        Ok(())
    }

    /// Maps a keyevent notification onto a removal, skipping region lookup hashes.
    pub(crate) fn decode(&self, channel: &str, raw_key: &str) -> Option<RemovalEvent> {
        let reason = match channel.rsplit(':').next()? {
            "expired" => RemovalReason::Expired,
            "evicted" => RemovalReason::Evicted,
            "del" => RemovalReason::ExternalDelete,
            _ => return None,
        };

        if self.region_keys.read().contains(raw_key) {
            return None;
        }

        let (key, region) = self.keys.parse_full_key(raw_key)?;
        tracing::debug!(cache.name = %self.handle_name, cache.key = %key, cache.region = ?region, %reason, "redis reported removal");
        Some(RemovalEvent::new(key, region.as_deref(), reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> KeyspaceListener {
        KeyspaceListener {
            client: Client::open("redis://127.0.0.1:6379").unwrap(),
            database: 4,
            keys: KeyCodec::new(Some("app/"), true),
            region_keys: Arc::new(RwLock::new(HashSet::from(["app/orders".to_owned()]))),
            removals: Arc::new(ObserverList::new()),
            handle_name: "redis".to_owned(),
            clock: Clock::new_frozen(),
        }
    }

    #[test]
    fn channels_target_the_database() {
        assert_eq!(
            listener().channels(),
            [
                "__keyevent@4__:expired".to_owned(),
                "__keyevent@4__:evicted".to_owned(),
                "__keyevent@4__:del".to_owned()
            ]
        );
    }

    #[test]
    fn events_map_to_reasons() {
        let listener = listener();

        let expired = listener.decode("__keyevent@4__:expired", "app/orders:42").unwrap();
        assert_eq!(expired.key, "42");
        assert_eq!(expired.region.as_deref(), Some("orders"));
        assert_eq!(expired.reason, RemovalReason::Expired);

        let evicted = listener.decode("__keyevent@4__:evicted", "app/k").unwrap();
        assert_eq!(evicted.reason, RemovalReason::Evicted);
        assert_eq!(evicted.region, None);

        let deleted = listener.decode("__keyevent@4__:del", "app/k").unwrap();
        assert_eq!(deleted.reason, RemovalReason::ExternalDelete);
    }

    #[test]
    fn region_hashes_and_foreign_keys_are_skipped() {
        let listener = listener();
        assert!(listener.decode("__keyevent@4__:del", "app/orders").is_none());
        assert!(listener.decode("__keyevent@4__:del", "other/k").is_none());
        assert!(listener.decode("__keyevent@4__:set", "app/k").is_none());
    }
}
