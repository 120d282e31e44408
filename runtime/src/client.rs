//! The cache client.
//!
//! [`CacheClient`] wires the pieces together: it opens the channel and reply
//! queue, starts the reply and event consumers, and exposes one typed method
//! per request kind.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use shardlink_core::Snowflake;
//! use shardlink_runtime::{CacheClient, ClientConfig};
//! use shardlink_testing::InMemoryBroker;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct Guild {
//!     id: Snowflake,
//!     name: String,
//! }
//!
//! # async fn example() -> Result<(), shardlink_core::RpcError> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let (client, _events) = CacheClient::start(broker, ClientConfig::new(4)).await?;
//!
//! let guild: Option<Guild> = client.get_guild(Snowflake::new(41_771_983_423_143_937)).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::connection::{ActiveChannel, ConnectionManager};
use crate::consumer::{
    ConsumerHandle, EventHandler, EventStream, ReplyHandler, event_stream, spawn_consumer,
};
use crate::dispatcher::RequestDispatcher;
use crate::metrics::ConnectionMetrics;
use crate::registry::CorrelationRegistry;
use crate::retry::{RetryPolicy, retry_with_predicate};
use serde::de::DeserializeOwned;
use shardlink_core::broker::Broker;
use shardlink_core::request::{
    ById, ByGuildId, ByGuildIdAndId, ByGuildIdPaginated, BySnowflakes, CacheRequest,
};
use shardlink_core::routing::{ShardId, ShardRouter};
use shardlink_core::{RpcError, Snowflake};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Shard that presence updates are sent to.
const PRESENCE_SHARD: ShardId = ShardId::new(0);

/// Request/response client for the cache workers.
///
/// Cheap to clone; clones share the channel, the consumers and the pending
/// requests.
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    router: ShardRouter,
    connection: Arc<ConnectionManager>,
    registry: Arc<CorrelationRegistry>,
    dispatcher: RequestDispatcher,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl CacheClient {
    /// Open a channel on `broker`, start consuming replies and events, and
    /// return the client with its event stream.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Configuration`] if `config` is invalid, or
    /// [`RpcError::Transport`] if the channel, the reply queue or either
    /// consumer cannot be set up.
    pub async fn start(
        broker: Arc<dyn Broker>,
        config: ClientConfig,
    ) -> Result<(Self, EventStream), RpcError> {
        config.validate()?;
        let router = ShardRouter::new(config.total_shards)?;

        let connection = Arc::new(ConnectionManager::new(broker, config.recovery_wait));
        let active = connection.open_channel().await?;

        let registry = Arc::new(CorrelationRegistry::new());
        let (sender, receiver) = mpsc::channel(config.event_buffer_size);

        let replies = spawn_consumer(
            Arc::new(ReplyHandler::new(Arc::clone(&registry))),
            connection.subscribe(),
            config.consumer_concurrency,
        );
        let events = spawn_consumer(
            Arc::new(EventHandler::new(
                config.event_exchange.clone(),
                config.event_binding_weight,
                config.event_names.clone(),
                sender,
            )),
            connection.subscribe(),
            config.consumer_concurrency,
        );

        let dispatcher = RequestDispatcher::new(
            Arc::clone(&connection),
            Arc::clone(&registry),
            config.cache_exchange.clone(),
        );
        let client = Self {
            inner: Arc::new(Inner {
                config,
                router,
                connection,
                registry,
                dispatcher,
                consumers: Mutex::new(vec![replies, events]),
            }),
        };

        if let Err(e) = client.await_consumers(&active).await {
            client.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            total_shards = client.inner.config.total_shards,
            reply_queue = %active.reply_queue,
            "Cache client started"
        );
        Ok((client, event_stream(receiver)))
    }

    /// The configuration this client runs with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The router mapping entities to shards.
    #[must_use]
    pub fn router(&self) -> &ShardRouter {
        &self.inner.router
    }

    /// Shard owning `guild`.
    #[must_use]
    pub fn shard_for(&self, guild: Snowflake) -> ShardId {
        self.inner.router.shard_for(guild)
    }

    /// Number of requests waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Name of the current reply queue, if a channel is active.
    pub async fn reply_queue(&self) -> Option<String> {
        self.inner.connection.reply_queue().await
    }

    /// Send `request` to `shard` with the configured timeout.
    ///
    /// Returns the raw reply body, or `None` if the entity was not found.
    ///
    /// # Errors
    ///
    /// See [`RequestDispatcher::dispatch`].
    pub async fn request(
        &self,
        shard: ShardId,
        request: &CacheRequest,
    ) -> Result<Option<String>, RpcError> {
        self.request_with_timeout(shard, request, self.inner.config.request_timeout)
            .await
    }

    /// Send `request` to `shard`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// See [`RequestDispatcher::dispatch`].
    pub async fn request_with_timeout(
        &self,
        shard: ShardId,
        request: &CacheRequest,
        timeout: Duration,
    ) -> Result<Option<String>, RpcError> {
        self.inner.dispatcher.dispatch(shard, request, timeout).await
    }

    /// Send `request` to `shard` and deserialize the reply as `T`.
    ///
    /// # Errors
    ///
    /// See [`RequestDispatcher::dispatch`]; a body that is not a valid `T`
    /// is reported as [`RpcError::Decode`].
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        shard: ShardId,
        request: &CacheRequest,
    ) -> Result<Option<T>, RpcError> {
        match self.request(shard, request).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn guild_request<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        request: CacheRequest,
    ) -> Result<Option<T>, RpcError> {
        self.request_json(self.shard_for(guild), &request).await
    }

    /// Fetch a user from `shard`.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_user<T: DeserializeOwned>(
        &self,
        shard: ShardId,
        user: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.request_json(shard, &CacheRequest::GetUser(ById::new(user)))
            .await
    }

    /// Fetch several users from `shard`.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_users<T: DeserializeOwned>(
        &self,
        shard: ShardId,
        users: Vec<Snowflake>,
    ) -> Result<Option<T>, RpcError> {
        let request = CacheRequest::GetUsers(BySnowflakes { snowflakes: users });
        self.request_json(shard, &request).await
    }

    /// Fetch a guild.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_guild<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetGuild(ById::new(guild)))
            .await
    }

    /// Fetch a guild member.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_member<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        user: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetMember(ByGuildIdAndId::new(guild, user)))
            .await
    }

    /// Fetch a page of guild members.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Configuration`] if the page's guild id is not a
    /// snowflake; otherwise see [`request_json`](Self::request_json).
    pub async fn get_members<T: DeserializeOwned>(
        &self,
        page: ByGuildIdPaginated,
    ) -> Result<Option<T>, RpcError> {
        let guild: Snowflake = page.guild_id.parse()?;
        self.guild_request(guild, CacheRequest::GetMembers(page)).await
    }

    /// Fetch a guild channel.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_channel<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        channel: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetChannel(ByGuildIdAndId::new(guild, channel)))
            .await
    }

    /// Fetch every channel of a guild.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_channels<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetChannels(ByGuildId::new(guild)))
            .await
    }

    /// Fetch a thread.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_thread<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        thread: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetThread(ByGuildIdAndId::new(guild, thread)))
            .await
    }

    /// Fetch every thread of a guild.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_threads<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetThreads(ByGuildId::new(guild)))
            .await
    }

    /// Fetch a role.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_role<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        role: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetRole(ByGuildIdAndId::new(guild, role)))
            .await
    }

    /// Fetch every role of a guild.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_roles<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetRoles(ByGuildId::new(guild)))
            .await
    }

    /// Fetch an emoji.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_emoji<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        emoji: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetEmoji(ByGuildIdAndId::new(guild, emoji)))
            .await
    }

    /// Fetch every emoji of a guild.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_emojis<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetEmojis(ByGuildId::new(guild)))
            .await
    }

    /// Fetch a stage instance.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_stage_instance<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        stage: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        let request = CacheRequest::GetStageInstance(ByGuildIdAndId::new(guild, stage));
        self.guild_request(guild, request).await
    }

    /// Fetch every stage instance of a guild.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_stage_instances<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        self.guild_request(guild, CacheRequest::GetStageInstances(ByGuildId::new(guild)))
            .await
    }

    /// Fetch the members of a thread.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_thread_members<T: DeserializeOwned>(
        &self,
        guild: Snowflake,
        thread: Snowflake,
    ) -> Result<Option<T>, RpcError> {
        let request = CacheRequest::GetThreadMembers(ByGuildIdAndId::new(guild, thread));
        self.guild_request(guild, request).await
    }

    /// Fetch the statistics of the worker serving `shard`.
    ///
    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_stats<T: DeserializeOwned>(&self, shard: ShardId) -> Result<Option<T>, RpcError> {
        self.request_json(shard, &CacheRequest::GetStats).await
    }

    /// Ask the gateway to update the bot's presence. The reply body is
    /// ignored.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn update_presence(&self, presence: serde_json::Value) -> Result<(), RpcError> {
        self.request(PRESENCE_SHARD, &CacheRequest::UpdatePresence(presence))
            .await
            .map(drop)
    }

    /// Ask the gateway to update the bot's voice state in `guild`. The reply
    /// body is ignored.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn update_voice_state(
        &self,
        guild: Snowflake,
        voice_state: serde_json::Value,
    ) -> Result<(), RpcError> {
        self.request(self.shard_for(guild), &CacheRequest::UpdateVoiceState(voice_state))
            .await
            .map(drop)
    }

    /// Replace the channel and reply queue, and wait for both consumers to
    /// register on the new channel.
    ///
    /// Requests still waiting on the old reply queue are not failed; they
    /// run into their timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] if the new channel, its reply queue or
    /// a consumer cannot be set up.
    pub async fn recover(&self) -> Result<(), RpcError> {
        ConnectionMetrics::record_recovery();
        let active = self.inner.connection.open_channel().await?;
        self.await_consumers(&active).await?;
        tracing::info!(
            generation = active.generation,
            reply_queue = %active.reply_queue,
            pending = self.pending_requests(),
            "Connection recovered"
        );
        Ok(())
    }

    /// [`recover`](Self::recover), retried with backoff while it fails with
    /// a transport error.
    ///
    /// # Errors
    ///
    /// Returns the last error once `policy` is exhausted.
    pub async fn recover_with_backoff(&self, policy: RetryPolicy) -> Result<(), RpcError> {
        retry_with_predicate(policy, || self.recover(), RpcError::is_transport).await
    }

    /// Stop both consumers, wait for deliveries being handled, and close
    /// the channel. The event stream ends afterwards.
    pub async fn shutdown(&self) {
        let consumers: Vec<ConsumerHandle> = self.inner.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            consumer.stop().await;
        }
        self.inner.connection.close().await;
        tracing::info!(pending = self.pending_requests(), "Cache client shut down");
    }

    async fn await_consumers(&self, active: &ActiveChannel) -> Result<(), RpcError> {
        let consumers = self.inner.consumers.lock().await;
        for consumer in consumers.iter() {
            consumer.registered(active.generation).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use shardlink_testing::InMemoryBroker;

    fn config() -> ClientConfig {
        ClientConfig::new(4).with_request_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_connecting() {
        let broker = InMemoryBroker::new();
        let result = CacheClient::start(Arc::new(broker.clone()), ClientConfig::new(0)).await;

        assert!(matches!(result, Err(RpcError::Configuration(_))));
        assert_eq!(broker.channels_opened(), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_transport_error() {
        let broker = InMemoryBroker::new();
        broker.set_fail_open(true);
        let result = CacheClient::start(Arc::new(broker), config()).await;

        assert!(result.is_err_and(|e| e.is_transport()));
    }

    #[tokio::test]
    async fn routes_guild_lookups_by_guild() {
        let broker = InMemoryBroker::new();
        let (client, _events) = CacheClient::start(Arc::new(broker.clone()), config())
            .await
            .unwrap();

        // (1 << 32) >> 22 == 1024, and 1024 % 4 == 0; one more timestamp
        // tick lands on shard 1.
        let guild = Snowflake::new((1 << 32) + (1 << 22));
        let result: Result<Option<serde_json::Value>, _> = client.get_roles(guild).await;
        assert!(result.unwrap_err().is_timeout());

        let published = broker.published_to("cache");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "1");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_page_guild_is_a_configuration_error() {
        let broker = InMemoryBroker::new();
        let (client, _events) = CacheClient::start(Arc::new(broker), config()).await.unwrap();

        let mut page = ByGuildIdPaginated::new(Snowflake::new(1));
        page.guild_id = "not-a-snowflake".to_string();
        let result: Result<Option<serde_json::Value>, _> = client.get_members(page).await;
        assert!(matches!(result, Err(RpcError::Configuration(_))));
    }

    #[tokio::test]
    async fn shutdown_closes_the_channel() {
        let broker = InMemoryBroker::new();
        let (client, _events) = CacheClient::start(Arc::new(broker), config()).await.unwrap();
        assert!(client.reply_queue().await.is_some());

        client.shutdown().await;
        assert!(client.reply_queue().await.is_none());
        let result = client.request(ShardId::new(0), &CacheRequest::GetStats).await;
        assert!(result.unwrap_err().is_transport());
    }
}
