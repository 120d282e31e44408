//! Per-event memoization of lookups.

#![allow(clippy::unwrap_used)]

use serde::Deserialize;
use shardlink_core::context::EventContext;
use shardlink_core::routing::ShardId;
use shardlink_core::{RpcError, Snowflake};
use shardlink_runtime::{CacheClient, ClientConfig, ContextualSupplier};
use shardlink_testing::{FakeCacheWorker, InMemoryBroker, Reply, init_test_tracing};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const GUILD: Snowflake = Snowflake::new(4 << 22);

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Member {
    nick: Option<String>,
}

async fn setup<F>(responder: F) -> (InMemoryBroker, FakeCacheWorker, CacheClient)
where
    F: Fn(&shardlink_core::request::RequestEnvelope) -> Reply + Send + Sync + 'static,
{
    init_test_tracing();
    let broker = InMemoryBroker::new();
    let config = ClientConfig::new(4).with_request_timeout(Duration::from_millis(200));
    let (client, _events) = CacheClient::start(Arc::new(broker.clone()), config)
        .await
        .unwrap();
    let shard = client.shard_for(GUILD);
    let worker = FakeCacheWorker::spawn(&broker, "cache", shard, responder).await.unwrap();
    (broker, worker, client)
}

fn context() -> EventContext {
    EventContext::new(Some(GUILD), ShardId::new(0), None)
}

#[tokio::test]
async fn repeated_lookups_in_one_context_reach_the_worker_once() {
    let (_broker, worker, client) =
        setup(|_| Reply::Plain(r#"{"nick":"bee"}"#.to_string())).await;
    let context = context();
    let supplier = ContextualSupplier::new(&client, &context);

    let first: Option<Member> = supplier.member(Snowflake::new(7)).await.unwrap();
    let second: Option<Member> = supplier.member(Snowflake::new(7)).await.unwrap();

    assert_eq!(first, Some(Member { nick: Some("bee".to_string()) }));
    assert_eq!(first, second);
    assert_eq!(worker.received().len(), 1);
}

#[tokio::test]
async fn concurrent_lookups_share_one_request() {
    let (_broker, worker, client) = setup(|_| {
        Reply::Plain(r#"{"nick":null}"#.to_string()).after(Duration::from_millis(30))
    })
    .await;
    let context = context();
    let supplier = ContextualSupplier::new(&client, &context);

    let (a, b): (Result<Option<Member>, RpcError>, Result<Option<Member>, RpcError>) =
        tokio::join!(supplier.member(Snowflake::new(7)), supplier.member(Snowflake::new(7)));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(worker.received().len(), 1);
}

#[tokio::test]
async fn not_found_is_remembered() {
    let (_broker, worker, client) = setup(|_| Reply::NotFound).await;
    let context = context();
    let supplier = ContextualSupplier::new(&client, &context);

    let first: Option<Member> = supplier.member(Snowflake::new(7)).await.unwrap();
    let second: Option<Member> = supplier.member(Snowflake::new(7)).await.unwrap();

    assert_eq!((first, second), (None, None));
    assert_eq!(worker.received().len(), 1);
}

#[tokio::test]
async fn separate_contexts_do_not_share_results() {
    let (_broker, worker, client) =
        setup(|_| Reply::Plain(r#"{"nick":"bee"}"#.to_string())).await;

    for _ in 0..2 {
        let context = context();
        let supplier = ContextualSupplier::new(&client, &context);
        let _: Option<Member> = supplier.member(Snowflake::new(7)).await.unwrap();
    }

    assert_eq!(worker.received().len(), 2);
}

#[tokio::test]
async fn different_keys_are_looked_up_separately() {
    let (_broker, worker, client) = setup(|_| Reply::Plain("[]".to_string())).await;
    let context = context();
    let supplier = ContextualSupplier::new(&client, &context);

    let _: Option<Vec<Member>> = supplier.roles().await.unwrap();
    let _: Option<Vec<Member>> = supplier.channels().await.unwrap();
    let _: Option<Vec<Member>> = supplier.roles().await.unwrap();

    let tags: Vec<u16> = worker.received().iter().map(|r| r.envelope.type_tag).collect();
    assert_eq!(tags, vec![10, 6]);
}

#[tokio::test]
async fn failures_are_retried_on_the_next_lookup() {
    let fail = Arc::new(AtomicBool::new(true));
    let (_broker, worker, client) = setup({
        let fail = Arc::clone(&fail);
        move |_| {
            if fail.swap(false, Ordering::SeqCst) {
                Reply::Status("503".to_string())
            } else {
                Reply::Plain(r#"{"nick":"bee"}"#.to_string())
            }
        }
    })
    .await;
    let context = context();
    let supplier = ContextualSupplier::new(&client, &context);

    let first: Result<Option<Member>, RpcError> = supplier.member(Snowflake::new(7)).await;
    assert!(first.unwrap_err().is_remote());

    let second: Option<Member> = supplier.member(Snowflake::new(7)).await.unwrap();
    assert!(second.is_some());
    assert_eq!(worker.received().len(), 2);
}

#[tokio::test]
async fn guild_lookups_need_a_guild() {
    let (_broker, _worker, client) = setup(|_| Reply::NotFound).await;
    let context = EventContext::new(None, ShardId::new(0), None);
    let supplier = ContextualSupplier::new(&client, &context);

    let result: Result<Option<Member>, RpcError> = supplier.guild().await;
    assert!(matches!(result, Err(RpcError::Configuration(_))));
}
