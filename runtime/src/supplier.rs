//! Lookups memoized for the duration of one event.
//!
//! A handler processing an event often asks for the same guild or member
//! several times, from code paths that know nothing about each other.
//! [`ContextualSupplier`] routes every lookup through the event's
//! [`ContextCache`](shardlink_core::context::ContextCache), so each distinct
//! lookup reaches the cache workers at most once per event, including
//! lookups that found nothing. Failed lookups are not remembered.
//!
//! ```rust,no_run
//! # use shardlink_core::context::EventContext;
//! # use shardlink_runtime::{CacheClient, ContextualSupplier};
//! # async fn example(client: &CacheClient, context: &EventContext) -> Result<(), shardlink_core::RpcError> {
//! let supplier = ContextualSupplier::new(client, context);
//! let first: Option<serde_json::Value> = supplier.guild().await?;
//! let again: Option<serde_json::Value> = supplier.guild().await?; // no second request
//! # Ok(())
//! # }
//! ```

use crate::client::CacheClient;
use serde::de::DeserializeOwned;
use shardlink_core::context::{CacheKey, EventContext};
use shardlink_core::request::ByGuildIdPaginated;
use shardlink_core::{RpcError, Snowflake};
use std::future::Future;

/// A [`CacheClient`] bound to one [`EventContext`].
#[derive(Clone, Copy)]
pub struct ContextualSupplier<'a> {
    client: &'a CacheClient,
    context: &'a EventContext,
}

impl<'a> ContextualSupplier<'a> {
    /// Bind `client` to `context`.
    #[must_use]
    pub const fn new(client: &'a CacheClient, context: &'a EventContext) -> Self {
        Self { client, context }
    }

    /// The bound context.
    #[must_use]
    pub const fn context(&self) -> &'a EventContext {
        self.context
    }

    async fn memoized<T, F, Fut>(&self, key: CacheKey, lookup: F) -> Result<Option<T>, RpcError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, RpcError>>,
    {
        self.context.cache().get_or_try_compute(&key, lookup).await
    }

    fn guild_id(&self) -> Result<Snowflake, RpcError> {
        self.context.guild_id().ok_or_else(|| {
            RpcError::Configuration("the event is not associated with a guild".to_string())
        })
    }

    /// The user `user`, looked up on the event's shard.
    ///
    /// # Errors
    ///
    /// See [`CacheClient::request_json`].
    pub async fn user<T>(&self, user: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let shard = self.context.shard_id();
        self.memoized(CacheKey::new("user").push(user), || {
            self.client.get_user(shard, user)
        })
        .await
    }

    /// The event's guild.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Configuration`] if the event has no guild;
    /// otherwise see [`CacheClient::request_json`].
    pub async fn guild<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("guild").push(guild), || {
            self.client.get_guild(guild)
        })
        .await
    }

    /// A member of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn member<T>(&self, user: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("member").push(guild).push(user), || {
            self.client.get_member(guild, user)
        })
        .await
    }

    /// Every member of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn members<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("members").push(guild), || {
            self.client.get_members(ByGuildIdPaginated::new(guild))
        })
        .await
    }

    /// A channel of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn channel<T>(&self, channel: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("channel").push(guild).push(channel), || {
            self.client.get_channel(guild, channel)
        })
        .await
    }

    /// Every channel of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn channels<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("channels").push(guild), || {
            self.client.get_channels(guild)
        })
        .await
    }

    /// A thread of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn thread<T>(&self, thread: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("thread").push(guild).push(thread), || {
            self.client.get_thread(guild, thread)
        })
        .await
    }

    /// Every thread of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn threads<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("threads").push(guild), || {
            self.client.get_threads(guild)
        })
        .await
    }

    /// A role of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn role<T>(&self, role: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("role").push(guild).push(role), || {
            self.client.get_role(guild, role)
        })
        .await
    }

    /// Every role of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn roles<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("roles").push(guild), || {
            self.client.get_roles(guild)
        })
        .await
    }

    /// An emoji of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn emoji<T>(&self, emoji: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("emoji").push(guild).push(emoji), || {
            self.client.get_emoji(guild, emoji)
        })
        .await
    }

    /// Every emoji of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn emojis<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("emojis").push(guild), || {
            self.client.get_emojis(guild)
        })
        .await
    }

    /// A stage instance of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn stage_instance<T>(&self, stage: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("stage").push(guild).push(stage), || {
            self.client.get_stage_instance(guild, stage)
        })
        .await
    }

    /// Every stage instance of the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn stage_instances<T>(&self) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("stages").push(guild), || {
            self.client.get_stage_instances(guild)
        })
        .await
    }

    /// The members of a thread in the event's guild.
    ///
    /// # Errors
    ///
    /// See [`guild`](Self::guild).
    pub async fn thread_members<T>(&self, thread: Snowflake) -> Result<Option<T>, RpcError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let guild = self.guild_id()?;
        self.memoized(CacheKey::new("threadMembers").push(guild).push(thread), || {
            self.client.get_thread_members(guild, thread)
        })
        .await
    }
}
