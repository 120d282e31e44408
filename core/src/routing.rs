//! Shard routing.
//!
//! Maps an entity identifier to the shard that owns it. The mapping is a
//! pure function of `(entity id, total shards)` and must be identical on every
//! process, so that a request routed here lands on the worker that owns the
//! entity's shard everywhere else.
//!
//! ```
//! use shardlink_core::routing::{ShardRouter, shard_for};
//! use shardlink_core::snowflake::Snowflake;
//!
//! # fn main() -> Result<(), shardlink_core::error::RpcError> {
//! let router = ShardRouter::new(4)?;
//! let guild = Snowflake::new(0x0000_0001_0000_0000);
//!
//! // (0x1_0000_0000 >> 22) % 4 == 1024 % 4 == 0
//! assert_eq!(router.shard_for(guild).get(), 0);
//! assert_eq!(shard_for(guild.get(), 4)?, router.shard_for(guild));
//! # Ok(())
//! # }
//! ```

use crate::error::RpcError;
use crate::snowflake::Snowflake;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

/// Number of low bits (worker id, process id, increment) below the timestamp.
const TIMESTAMP_SHIFT: u32 = 22;

/// Index of a shard in `[0, total_shards)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u32);

impl ShardId {
    /// Wrap a raw shard index.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw shard index.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The routing key requests for this shard are published with.
    #[must_use]
    pub fn routing_key(self) -> String {
        self.0.to_string()
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the shard owning `entity_id` out of `total_shards`.
///
/// # Errors
///
/// Returns [`RpcError::Configuration`] if `total_shards` is zero.
pub fn shard_for(entity_id: u64, total_shards: u32) -> Result<ShardId, RpcError> {
    let total = NonZeroU32::new(total_shards).ok_or_else(|| {
        RpcError::Configuration("total shard count must be at least 1".to_string())
    })?;
    Ok(route(entity_id, total))
}

fn route(entity_id: u64, total: NonZeroU32) -> ShardId {
    let shard = (entity_id >> TIMESTAMP_SHIFT) % u64::from(total.get());
    // shard < total <= u32::MAX
    #[allow(clippy::cast_possible_truncation)]
    ShardId(shard as u32)
}

/// Shard router bound to a fixed shard count.
///
/// The shard count is configuration passed in at construction; there is no
/// process-wide routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    total_shards: NonZeroU32,
}

impl ShardRouter {
    /// Create a router for `total_shards` shards.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Configuration`] if `total_shards` is zero.
    pub fn new(total_shards: u32) -> Result<Self, RpcError> {
        NonZeroU32::new(total_shards)
            .map(|total_shards| Self { total_shards })
            .ok_or_else(|| {
                RpcError::Configuration("total shard count must be at least 1".to_string())
            })
    }

    /// Total number of shards this router distributes over.
    #[must_use]
    pub const fn total_shards(&self) -> u32 {
        self.total_shards.get()
    }

    /// The shard owning `entity`.
    #[must_use]
    pub fn shard_for(&self, entity: Snowflake) -> ShardId {
        route(entity.get(), self.total_shards)
    }
}
