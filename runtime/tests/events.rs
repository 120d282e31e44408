//! Broadcast event consumption through the in-memory broker.

#![allow(clippy::unwrap_used)]

use futures::StreamExt;
use serde_json::json;
use shardlink_core::broker::{Broker, MessageProperties};
use shardlink_core::codec::OCTET_STREAM;
use shardlink_runtime::{CacheClient, ClientConfig, EventStream};
use shardlink_testing::{ExchangeKind, InMemoryBroker, event_body, init_test_tracing, publish_event};
use std::sync::Arc;
use std::time::Duration;

async fn start(broker: &InMemoryBroker, config: ClientConfig) -> (CacheClient, EventStream) {
    init_test_tracing();
    broker.declare_exchange("events", ExchangeKind::Fanout);
    CacheClient::start(Arc::new(broker.clone()), config).await.unwrap()
}

async fn next(events: &mut EventStream) -> shardlink_core::event::ShardEvent {
    tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn events_reach_the_stream() {
    let broker = InMemoryBroker::new();
    let (_client, mut events) = start(&broker, ClientConfig::new(2)).await;

    publish_event(&broker, "events", event_body(1, "MESSAGE_CREATE", &json!({ "guild_id": "99" })))
        .await
        .unwrap();

    let event = next(&mut events).await;
    assert_eq!(event.shard_id.get(), 1);
    assert!(event.event.is_named("MESSAGE_CREATE"));
    assert_eq!(event.event.guild_id().map(|g| g.get()), Some(99));
}

#[tokio::test]
async fn undecodable_delivery_does_not_stop_the_consumer() {
    let broker = InMemoryBroker::new();
    let (_client, mut events) = start(&broker, ClientConfig::new(2)).await;

    publish_event(&broker, "events", b"definitely not zlib".to_vec())
        .await
        .unwrap();
    publish_event(&broker, "events", event_body(0, "GUILD_CREATE", &json!({ "id": "5" })))
        .await
        .unwrap();

    let event = next(&mut events).await;
    assert!(event.event.is_named("GUILD_CREATE"));
    assert_eq!(event.event.guild_id().map(|g| g.get()), Some(5));
}

#[tokio::test]
async fn plain_json_events_are_accepted() {
    let broker = InMemoryBroker::new();
    let (_client, mut events) = start(&broker, ClientConfig::new(2)).await;

    let channel = broker.connection().open_channel().await.unwrap();
    let body = json!({ "shard_id": 0, "event": { "t": "READY", "op": 0, "d": {} } });
    channel
        .publish(
            "events",
            "",
            MessageProperties::default().with_content_type("application/json"),
            body.to_string().into_bytes(),
        )
        .await
        .unwrap();

    assert!(next(&mut events).await.event.is_named("READY"));
}

#[tokio::test]
async fn envelopes_without_an_event_are_skipped() {
    let broker = InMemoryBroker::new();
    let (_client, mut events) = start(&broker, ClientConfig::new(2)).await;

    let channel = broker.connection().open_channel().await.unwrap();
    let properties = MessageProperties::default().with_content_type(OCTET_STREAM);
    let empty = shardlink_core::codec::deflate(json!({ "shard_id": 0 }).to_string().as_bytes());
    channel.publish("events", "", properties, empty).await.unwrap();
    publish_event(&broker, "events", event_body(0, "TYPING_START", &json!({})))
        .await
        .unwrap();

    assert!(next(&mut events).await.event.is_named("TYPING_START"));
}

#[tokio::test]
async fn name_filter_drops_unwanted_events() {
    let broker = InMemoryBroker::new();
    let config = ClientConfig::new(2).with_event_names(["GUILD_DELETE"]);
    let (_client, mut events) = start(&broker, config).await;

    publish_event(&broker, "events", event_body(0, "PRESENCE_UPDATE", &json!({})))
        .await
        .unwrap();
    publish_event(&broker, "events", event_body(0, "GUILD_DELETE", &json!({ "id": "8" })))
        .await
        .unwrap();

    assert!(next(&mut events).await.event.is_named("GUILD_DELETE"));
}

#[tokio::test]
async fn event_consumer_follows_recovery() {
    let broker = InMemoryBroker::new();
    let (client, mut events) = start(&broker, ClientConfig::new(2)).await;

    broker.kill_channels();
    client.recover().await.unwrap();

    publish_event(&broker, "events", event_body(1, "CHANNEL_CREATE", &json!({ "guild_id": "3" })))
        .await
        .unwrap();
    assert!(next(&mut events).await.event.is_named("CHANNEL_CREATE"));
}

#[tokio::test]
async fn stream_ends_after_shutdown() {
    let broker = InMemoryBroker::new();
    let (client, mut events) = start(&broker, ClientConfig::new(2)).await;

    client.shutdown().await;
    let end = tokio::time::timeout(Duration::from_secs(1), events.next()).await.unwrap();
    assert!(end.is_none());
}
