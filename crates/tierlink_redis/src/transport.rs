// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use futures::{StreamExt, stream::BoxStream};
use redis::{Client, IntoConnectionInfo, aio::ConnectionManager};
use tierlink_handle::{Error, ErrorKind, Result};

use crate::retry::to_error;

/// Moves backplane payloads between processes.
///
/// [`RedisCacheBackplane`](crate::RedisCacheBackplane) only batches and
/// encodes; the transport publishes each payload and yields every payload
/// received on the shared channel, including the ones this process sent.
pub trait BackplaneTransport: Send + Sync + 'static {
    /// Publishes one payload.
    fn publish(&self, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Opens a subscription. The stream ends when the subscription is lost.
    fn subscribe(&self) -> impl Future<Output = Result<BoxStream<'static, Vec<u8>>>> + Send;
}

/// Redis pub/sub transport.
#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    channel: String,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport").field("channel", &self.channel).finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// Connects a publisher and prepares subscriptions on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] for an invalid connection string and a
    /// store error if the server cannot be reached.
    pub async fn connect(connection_string: &str, channel: impl Into<String>) -> Result<Self> {
        let info = connection_string
            .into_connection_info()
            .map_err(|e| Error::with_cause(ErrorKind::Configuration, e))?;
        let client = Client::open(info).map_err(|e| Error::with_cause(ErrorKind::Configuration, e))?;
        let conn = client.get_connection_manager().await.map_err(to_error)?;

        Ok(Self {
            client,
            conn,
            channel: channel.into(),
        })
    }

    /// Returns the pub/sub channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl BackplaneTransport for RedisTransport {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(to_error)
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(to_error)?;
        pubsub.subscribe(&self.channel).await.map_err(to_error)?;

        let channel = self.channel.clone();
        Ok(pubsub
            .into_on_message()
            .filter_map(move |message| {
                let payload = match message.get_payload::<Vec<u8>>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "unreadable backplane payload");
                        None
                    }
                };
                async move { payload }
            })
            .boxed())
    }
}
