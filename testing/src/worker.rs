//! Fake cache worker.
//!
//! Stands in for the remote side of the protocol: consumes requests for one
//! shard from the cache exchange and answers each one on its `reply_to`
//! queue, the way a real cache worker would.

use crate::broker::InMemoryBroker;
use futures::StreamExt;
use shardlink_core::broker::{Broker, BrokerChannel, BrokerError, MessageProperties, QueueSpec};
use shardlink_core::codec::{OCTET_STREAM, decode_request, deflate};
use shardlink_core::request::RequestEnvelope;
use shardlink_core::routing::ShardId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How the worker answers one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status `"200"` with a plain-text body
    Plain(String),
    /// Status `"200"` with a zlib-compressed body
    Compressed(String),
    /// Status `"404"`
    NotFound,
    /// Any other status, with an empty body
    Status(String),
    /// Status `"200"` with a body that claims compression but is not zlib
    Corrupt,
    /// No reply at all
    Silent,
    /// The inner reply, sent after a delay
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    /// Send this reply after `delay`.
    #[must_use]
    pub fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }

    fn into_message(self) -> Option<(MessageProperties, Vec<u8>)> {
        let ok = MessageProperties::default().with_kind("200");
        match self {
            Self::Plain(body) => Some((ok, body.into_bytes())),
            Self::Compressed(body) => Some((
                ok.with_content_type(OCTET_STREAM),
                deflate(body.as_bytes()),
            )),
            Self::NotFound => Some((MessageProperties::default().with_kind("404"), Vec::new())),
            Self::Status(status) => Some((MessageProperties::default().with_kind(status), Vec::new())),
            Self::Corrupt => Some((ok.with_content_type(OCTET_STREAM), b"not zlib".to_vec())),
            Self::Silent | Self::Delayed(..) => None,
        }
    }
}

/// A request as the worker received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRequest {
    /// Routing key the request was published with
    pub routing_key: String,
    /// Properties of the request message
    pub properties: MessageProperties,
    /// Decoded envelope
    pub envelope: RequestEnvelope,
}

type Responder = dyn Fn(&RequestEnvelope) -> Reply + Send + Sync;

/// A cache worker serving one shard. Stops when dropped.
pub struct FakeCacheWorker {
    channel: Arc<dyn BrokerChannel>,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    task: JoinHandle<()>,
}

impl FakeCacheWorker {
    /// Start a worker consuming `exchange` with `shard`'s routing key on its
    /// own connection to `broker`.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the worker's queue cannot be set up.
    pub async fn spawn<F>(
        broker: &InMemoryBroker,
        exchange: &str,
        shard: ShardId,
        responder: F,
    ) -> Result<Self, BrokerError>
    where
        F: Fn(&RequestEnvelope) -> Reply + Send + Sync + 'static,
    {
        let connection = broker.connection();
        let channel = connection.open_channel().await?;
        let queue = channel.declare_queue(QueueSpec::event_queue()).await?;
        channel.bind_queue(&queue, exchange, &shard.routing_key()).await?;
        let mut requests = channel.consume(&queue).await?;

        let received = Arc::new(Mutex::new(Vec::new()));
        let responder: Arc<Responder> = Arc::new(responder);

        let task = {
            let channel = Arc::clone(&channel);
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                while let Some(Ok(delivery)) = requests.next().await {
                    let Ok(envelope) = decode_request(&delivery.body) else {
                        tracing::warn!("Fake worker received an undecodable request");
                        continue;
                    };
                    let reply = responder(&envelope);
                    lock(&received).push(ReceivedRequest {
                        routing_key: delivery.routing_key.clone(),
                        properties: delivery.properties.clone(),
                        envelope,
                    });

                    let (Some(reply_to), Some(correlation_id)) =
                        (delivery.properties.reply_to, delivery.properties.correlation_id)
                    else {
                        continue;
                    };
                    tokio::spawn(answer(Arc::clone(&channel), reply_to, correlation_id, reply));
                }
            })
        };

        Ok(Self {
            channel,
            received,
            task,
        })
    }

    /// Requests received so far, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<ReceivedRequest> {
        lock(&self.received).clone()
    }

    /// Send an unsolicited reply, as a worker answering a request it
    /// received long ago would.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the reply cannot be published.
    pub async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        reply: Reply,
    ) -> Result<(), BrokerError> {
        match reply.into_message() {
            Some((properties, body)) => {
                self.channel
                    .publish("", reply_to, properties.with_correlation_id(correlation_id), body)
                    .await
            },
            None => Ok(()),
        }
    }
}

impl Drop for FakeCacheWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(channel: Arc<dyn BrokerChannel>, reply_to: String, correlation_id: String, reply: Reply) {
    let mut reply = reply;
    while let Reply::Delayed(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }

    if let Some((properties, body)) = reply.into_message() {
        let properties = properties.with_correlation_id(correlation_id);
        if let Err(e) = channel.publish("", &reply_to, properties, body).await {
            tracing::debug!(error = %e, "Fake worker could not publish its reply");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
