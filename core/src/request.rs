//! Request kinds and the request envelope.
//!
//! Requests form a closed set: each [`CacheRequest`] variant has a fixed
//! integer type tag and a payload shape. New kinds are added by extending the
//! enum, never by inspecting types at runtime.
//!
//! On the wire a request is a [`RequestEnvelope`]:
//!
//! ```json
//! { "t": 3, "d": { "id": "80351110224678912", "gid": "41771983423143937" } }
//! ```

use crate::snowflake::Snowflake;
use serde::{Deserialize, Serialize};

/// Payload addressing one entity by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ById {
    /// Entity id
    pub id: String,
}

impl ById {
    /// Build from a snowflake.
    #[must_use]
    pub fn new(id: Snowflake) -> Self {
        Self { id: id.to_string() }
    }
}

/// Payload addressing every entity of one kind in a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByGuildId {
    /// Guild id
    #[serde(rename = "gid")]
    pub guild_id: String,
}

impl ByGuildId {
    /// Build from a snowflake.
    #[must_use]
    pub fn new(guild_id: Snowflake) -> Self {
        Self {
            guild_id: guild_id.to_string(),
        }
    }
}

/// Payload addressing one entity inside a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByGuildIdAndId {
    /// Entity id
    pub id: String,
    /// Guild id
    #[serde(rename = "gid")]
    pub guild_id: String,
}

impl ByGuildIdAndId {
    /// Build from snowflakes.
    #[must_use]
    pub fn new(guild_id: Snowflake, id: Snowflake) -> Self {
        Self {
            id: id.to_string(),
            guild_id: guild_id.to_string(),
        }
    }
}

/// Payload for a paginated listing inside a guild.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ByGuildIdPaginated {
    /// Guild id
    #[serde(rename = "gid")]
    pub guild_id: String,
    /// First id of the page (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Last id of the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Maximum number of entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ByGuildIdPaginated {
    /// An unbounded page over the whole guild.
    #[must_use]
    pub fn new(guild_id: Snowflake) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            ..Self::default()
        }
    }

    /// Start the page at `start`.
    #[must_use]
    pub fn start(mut self, start: Snowflake) -> Self {
        self.start = Some(start.to_string());
        self
    }

    /// End the page at `end`.
    #[must_use]
    pub fn end(mut self, end: Snowflake) -> Self {
        self.end = Some(end.to_string());
        self
    }

    /// Limit the page to `limit` entries.
    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Payload addressing several entities by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BySnowflakes {
    /// Entity ids
    #[serde(rename = "ids")]
    pub snowflakes: Vec<Snowflake>,
}

/// Every request the cache workers understand.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRequest {
    /// Fetch a user
    GetUser(ById),
    /// Fetch a guild
    GetGuild(ById),
    /// Fetch a guild member
    GetMember(ByGuildIdAndId),
    /// List guild members
    GetMembers(ByGuildIdPaginated),
    /// Fetch a guild channel
    GetChannel(ByGuildIdAndId),
    /// List guild channels
    GetChannels(ByGuildId),
    /// Fetch a thread
    GetThread(ByGuildIdAndId),
    /// List active threads
    GetThreads(ByGuildId),
    /// Fetch a role
    GetRole(ByGuildIdAndId),
    /// List roles
    GetRoles(ByGuildId),
    /// Fetch an emoji
    GetEmoji(ByGuildIdAndId),
    /// List emojis
    GetEmojis(ByGuildId),
    /// Fetch a stage instance
    GetStageInstance(ByGuildIdAndId),
    /// List stage instances
    GetStageInstances(ByGuildId),
    /// Fetch several users
    GetUsers(BySnowflakes),
    /// List the members of a thread
    GetThreadMembers(ByGuildIdAndId),
    /// Update the bot's presence (opaque gateway payload)
    UpdatePresence(serde_json::Value),
    /// Update the bot's voice state (opaque gateway payload)
    UpdateVoiceState(serde_json::Value),
    /// Fetch worker statistics
    GetStats,
}

impl CacheRequest {
    /// The integer type tag selecting the payload schema.
    #[must_use]
    pub const fn type_tag(&self) -> u16 {
        match self {
            Self::GetUser(_) => 1,
            Self::GetGuild(_) => 2,
            Self::GetMember(_) => 3,
            Self::GetMembers(_) => 4,
            Self::GetChannel(_) => 5,
            Self::GetChannels(_) => 6,
            Self::GetThread(_) => 7,
            Self::GetThreads(_) => 8,
            Self::GetRole(_) => 9,
            Self::GetRoles(_) => 10,
            Self::GetEmoji(_) => 11,
            Self::GetEmojis(_) => 12,
            Self::GetStageInstance(_) => 13,
            Self::GetStageInstances(_) => 14,
            Self::GetUsers(_) => 15,
            Self::GetThreadMembers(_) => 50,
            Self::UpdatePresence(_) => 81,
            Self::UpdateVoiceState(_) => 82,
            Self::GetStats => 99,
        }
    }

    /// Short name used in logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetUser(_) => "get_user",
            Self::GetGuild(_) => "get_guild",
            Self::GetMember(_) => "get_member",
            Self::GetMembers(_) => "get_members",
            Self::GetChannel(_) => "get_channel",
            Self::GetChannels(_) => "get_channels",
            Self::GetThread(_) => "get_thread",
            Self::GetThreads(_) => "get_threads",
            Self::GetRole(_) => "get_role",
            Self::GetRoles(_) => "get_roles",
            Self::GetEmoji(_) => "get_emoji",
            Self::GetEmojis(_) => "get_emojis",
            Self::GetStageInstance(_) => "get_stage_instance",
            Self::GetStageInstances(_) => "get_stage_instances",
            Self::GetUsers(_) => "get_users",
            Self::GetThreadMembers(_) => "get_thread_members",
            Self::UpdatePresence(_) => "update_presence",
            Self::UpdateVoiceState(_) => "update_voice_state",
            Self::GetStats => "get_stats",
        }
    }

    /// Build the wire envelope for this request.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn to_envelope(&self) -> Result<RequestEnvelope, serde_json::Error> {
        let data = match self {
            Self::GetUser(d) | Self::GetGuild(d) => Some(serde_json::to_value(d)?),
            Self::GetMember(d)
            | Self::GetChannel(d)
            | Self::GetThread(d)
            | Self::GetRole(d)
            | Self::GetEmoji(d)
            | Self::GetStageInstance(d)
            | Self::GetThreadMembers(d) => Some(serde_json::to_value(d)?),
            Self::GetMembers(d) => Some(serde_json::to_value(d)?),
            Self::GetChannels(d)
            | Self::GetThreads(d)
            | Self::GetRoles(d)
            | Self::GetEmojis(d)
            | Self::GetStageInstances(d) => Some(serde_json::to_value(d)?),
            Self::GetUsers(d) => Some(serde_json::to_value(d)?),
            Self::UpdatePresence(d) | Self::UpdateVoiceState(d) => Some(d.clone()),
            Self::GetStats => None,
        };

        Ok(RequestEnvelope {
            type_tag: self.type_tag(),
            data,
        })
    }
}

/// The serialized form of a request: `{ "t": <tag>, "d": <payload> }`.
///
/// The payload is kept as opaque JSON so that either side can forward it
/// without knowing the schema behind the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Type tag selecting the payload schema
    #[serde(rename = "t")]
    pub type_tag: u16,
    /// Payload, absent for kinds without one
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
