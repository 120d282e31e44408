//! # Shardlink Testing
//!
//! Test doubles for code built on `shardlink-runtime`.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a deterministic, in-process [`Broker`](shardlink_core::broker::Broker)
//!   with fault injection
//! - [`FakeCacheWorker`]: the remote side of the request/response protocol
//! - [`publish_event`] / [`event_body`]: broadcast events the way gateway workers do
//! - [`init_test_tracing`]: log output for tests
//!
//! ## Example
//!
//! ```ignore
//! use shardlink_testing::{FakeCacheWorker, InMemoryBroker, Reply};
//!
//! #[tokio::test]
//! async fn fetches_a_user() {
//!     let broker = InMemoryBroker::new();
//!     let _worker = FakeCacheWorker::spawn(&broker, "cache", ShardId::new(0), |_| {
//!         Reply::Plain(r#"{"id":"1","username":"kord"}"#.to_string())
//!     })
//!     .await
//!     .unwrap();
//!
//!     let (client, _events) = CacheClient::start(Arc::new(broker), config).await.unwrap();
//!     let user: Option<User> = client.get_user(ShardId::new(0), Snowflake::new(1)).await.unwrap();
//!     assert!(user.is_some());
//! }
//! ```

use shardlink_core::broker::{Broker, BrokerError, MessageProperties};
use shardlink_core::codec::{OCTET_STREAM, deflate};

/// In-memory broker
pub mod broker;

/// Fake cache worker
pub mod worker;

pub use broker::{ExchangeKind, InMemoryBroker, InMemoryChannel};
pub use worker::{FakeCacheWorker, ReceivedRequest, Reply};

/// Install a `fmt` subscriber writing to the test harness, filtered by
/// `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a compressed event body for `shard` carrying a dispatch named `name`.
#[must_use]
pub fn event_body(shard: u32, name: &str, data: &serde_json::Value) -> Vec<u8> {
    let envelope = serde_json::json!({
        "shard_id": shard,
        "event": { "op": 0, "t": name, "s": 1, "d": data },
    });
    deflate(envelope.to_string().as_bytes())
}

/// Publish a compressed event body to `exchange` on a fresh connection.
///
/// # Errors
///
/// Returns a [`BrokerError`] if the event cannot be published.
pub async fn publish_event(
    broker: &InMemoryBroker,
    exchange: &str,
    body: Vec<u8>,
) -> Result<(), BrokerError> {
    let channel = broker.connection().open_channel().await?;
    let properties = MessageProperties::default().with_content_type(OCTET_STREAM);
    channel.publish(exchange, "", properties, body).await?;
    channel.close().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use shardlink_core::codec::decode_event;
    use serde_json::json;

    #[test]
    fn event_body_is_a_compressed_envelope() {
        let body = event_body(2, "MESSAGE_CREATE", &json!({ "guild_id": "1" }));
        let envelope = decode_event(Some(OCTET_STREAM), &body).unwrap();
        assert_eq!(envelope.shard_id, 2);
        assert!(envelope.event.unwrap().is_named("MESSAGE_CREATE"));
    }
}
