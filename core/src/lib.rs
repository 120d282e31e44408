//! # Shardlink Core
//!
//! Core types and traits for talking to a fleet of sharded cache workers over
//! a message broker.
//!
//! This crate holds everything that does not need a running broker:
//!
//! - **Routing**: which shard owns an entity (`(id >> 22) % total_shards`)
//! - **Requests**: the closed set of request kinds and their wire envelope
//! - **Codec**: request encoding, reply decoding, bounded zlib inflation
//! - **Broker seam**: the [`Broker`](broker::Broker) and
//!   [`BrokerChannel`](broker::BrokerChannel) traits the runtime is built on
//! - **Events**: broadcast event envelopes
//! - **Context**: per-event processing context with its memo cache
//!
//! The request/response runtime lives in `shardlink-runtime`; the AMQP adapter
//! in `shardlink-amqp`.
//!
//! ## Example
//!
//! ```
//! use shardlink_core::codec::encode_request;
//! use shardlink_core::request::{ByGuildIdAndId, CacheRequest};
//! use shardlink_core::routing::ShardRouter;
//! use shardlink_core::Snowflake;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let guild = Snowflake::new(41_771_983_423_143_937);
//! let member = Snowflake::new(80_351_110_224_678_912);
//!
//! let router = ShardRouter::new(16)?;
//! let shard = router.shard_for(guild);
//!
//! let body = encode_request(&CacheRequest::GetMember(ByGuildIdAndId::new(guild, member)))?;
//! assert!(shard.get() < 16);
//! assert!(body.starts_with(br#"{"t":3"#));
//! # Ok(())
//! # }
//! ```

pub use serde::{Deserialize, Serialize};

/// Broker traits, message properties and transport errors
pub mod broker;

/// Payload encoding and decoding
pub mod codec;

/// Per-event context and memo cache
pub mod context;

/// Error taxonomy
pub mod error;

/// Broadcast event envelopes
pub mod event;

/// Request kinds and envelope
pub mod request;

/// Reply status and outcome
pub mod response;

/// Shard routing
pub mod routing;

/// Snowflake identifiers
pub mod snowflake;

pub use error::RpcError;
pub use routing::{ShardId, ShardRouter, shard_for};
pub use snowflake::Snowflake;
