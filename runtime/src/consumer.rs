//! Reply and event consumers.
//!
//! Both consumers share one runner: it follows the connection manager's
//! channel announcements, subscribes on every new channel and hands each
//! delivery to its handler on a bounded pool of tasks. A slow delivery never
//! holds up the next one, and stopping the consumer waits for the deliveries
//! already being handled.

use crate::connection::ActiveChannel;
use crate::metrics::ConsumerMetrics;
use crate::registry::CorrelationRegistry;
use futures::{Stream, StreamExt};
use shardlink_core::broker::{BrokerError, Delivery, DeliveryStream, MessageProperties, QueueSpec};
use shardlink_core::codec::{decode_body, decode_event, inflate_to_string, is_compressed};
use shardlink_core::event::ShardEvent;
use shardlink_core::response::{ReplyStatus, ResponseOutcome};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Decoded broadcast events, in the order their deliveries were handled.
///
/// Ends once the client shuts down.
pub type EventStream = Pin<Box<dyn Stream<Item = ShardEvent> + Send>>;

/// Subscription state of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    Pending,
    Active(u64),
    Failed(u64, BrokerError),
}

/// What a consumer does with a channel and with each delivery.
pub(crate) trait DeliveryHandler: Send + Sync + 'static {
    /// Name used in logs.
    const NAME: &'static str;

    /// Start consuming on `active`.
    fn subscribe<'a>(
        &'a self,
        active: &'a ActiveChannel,
    ) -> impl Future<Output = Result<DeliveryStream, BrokerError>> + Send + 'a;

    /// Handle one delivery.
    fn handle(self: Arc<Self>, delivery: Delivery) -> impl Future<Output = ()> + Send;
}

/// A running consumer. Dropping the handle stops it without waiting.
pub struct ConsumerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    registration: watch::Receiver<Registration>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Wait until the consumer has subscribed on channel `generation` or a
    /// later one.
    ///
    /// # Errors
    ///
    /// Returns the subscription error if subscribing on that channel failed,
    /// or [`BrokerError::ChannelUnavailable`] if the consumer has stopped.
    pub async fn registered(&self, generation: u64) -> Result<(), BrokerError> {
        let mut registration = self.registration.clone();
        let state = registration
            .wait_for(|state| match state {
                Registration::Pending => false,
                Registration::Active(g) | Registration::Failed(g, _) => *g >= generation,
            })
            .await
            .map_err(|_| BrokerError::ChannelUnavailable)?
            .clone();

        match state {
            Registration::Failed(_, e) => Err(e),
            Registration::Pending | Registration::Active(_) => Ok(()),
        }
    }

    /// Stop consuming and wait for in-flight deliveries to be handled.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(consumer = self.name, error = %e, "Consumer task failed");
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Spawn a consumer that follows `channels` and handles at most
/// `concurrency` deliveries at once.
pub(crate) fn spawn_consumer<H: DeliveryHandler>(
    handler: Arc<H>,
    channels: watch::Receiver<Option<ActiveChannel>>,
    concurrency: usize,
) -> ConsumerHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (registered, registration) = watch::channel(Registration::Pending);
    let task = tokio::spawn(run(handler, channels, shutdown_rx, registered, concurrency));

    ConsumerHandle {
        name: H::NAME,
        shutdown,
        registration,
        task: Some(task),
    }
}

async fn run<H: DeliveryHandler>(
    handler: Arc<H>,
    mut channels: watch::Receiver<Option<ActiveChannel>>,
    mut shutdown: watch::Receiver<bool>,
    registered: watch::Sender<Registration>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();
    let mut generation = 0;

    'channels: loop {
        let active = tokio::select! {
            biased;
            () = wait_shutdown(&mut shutdown) => break,
            next = next_channel(&mut channels, generation) => match next {
                Some(active) => active,
                None => break,
            },
        };
        generation = active.generation;

        let mut deliveries = match handler.subscribe(&active).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::warn!(
                    consumer = H::NAME,
                    generation,
                    error = %e,
                    "Failed to subscribe, waiting for the next channel"
                );
                registered.send_replace(Registration::Failed(generation, e));
                continue;
            },
        };
        tracing::info!(consumer = H::NAME, generation, "Consumer registered");
        registered.send_replace(Registration::Active(generation));

        loop {
            tokio::select! {
                biased;
                () = wait_shutdown(&mut shutdown) => break 'channels,
                changed = channels.changed() => {
                    if changed.is_err() {
                        break 'channels;
                    }
                    let current = channels.borrow().as_ref().map(|active| active.generation);
                    if current != Some(generation) {
                        continue 'channels;
                    }
                },
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                            break 'channels;
                        };
                        let handler = Arc::clone(&handler);
                        in_flight.spawn(async move {
                            handler.handle(delivery).await;
                            drop(permit);
                        });
                    },
                    Some(Err(e)) => {
                        tracing::warn!(consumer = H::NAME, error = %e, "Delivery failed");
                    },
                    None => {
                        tracing::debug!(
                            consumer = H::NAME,
                            generation,
                            "Delivery stream ended, waiting for the next channel"
                        );
                        continue 'channels;
                    },
                },
            }

            while let Some(result) = in_flight.try_join_next() {
                log_join_error(H::NAME, result);
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        log_join_error(H::NAME, result);
    }
    tracing::info!(consumer = H::NAME, "Consumer stopped");
}

/// The first announced channel newer than `after`, or `None` once the
/// connection manager is gone.
async fn next_channel(
    channels: &mut watch::Receiver<Option<ActiveChannel>>,
    after: u64,
) -> Option<ActiveChannel> {
    loop {
        {
            let current = channels.borrow_and_update();
            if let Some(active) = current.as_ref().filter(|active| active.generation > after) {
                return Some(active.clone());
            }
        }
        if channels.changed().await.is_err() {
            return None;
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *shutdown.borrow_and_update();
        if stopping || shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn log_join_error(consumer: &'static str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(consumer, error = %e, "Delivery handler panicked");
    }
}

/// Fulfills pending requests from the reply queue.
pub(crate) struct ReplyHandler {
    registry: Arc<CorrelationRegistry>,
}

impl ReplyHandler {
    pub(crate) const fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self { registry }
    }
}

impl DeliveryHandler for ReplyHandler {
    const NAME: &'static str = "reply";

    fn subscribe<'a>(
        &'a self,
        active: &'a ActiveChannel,
    ) -> impl Future<Output = Result<DeliveryStream, BrokerError>> + Send + 'a {
        active.channel.consume(&active.reply_queue)
    }

    fn handle(self: Arc<Self>, delivery: Delivery) -> impl Future<Output = ()> + Send {
        async move {
            let MessageProperties {
                correlation_id,
                kind,
                content_type,
                ..
            } = delivery.properties;

            let Some(key) = correlation_id else {
                tracing::debug!("Dropping reply without a correlation id");
                return;
            };
            if !self.registry.contains(&key) {
                ConsumerMetrics::record_late_reply();
                tracing::debug!(correlation_id = %key, "Dropping reply for an unknown or expired request");
                return;
            }

            let outcome = match ReplyStatus::parse(kind.as_deref()) {
                ReplyStatus::Ok => decode_reply(content_type, delivery.body).await,
                ReplyStatus::NotFound => ResponseOutcome::NotFound,
                other => ResponseOutcome::unexpected_status(&other),
            };

            tracing::debug!(correlation_id = %key, outcome = outcome.label(), "Reply received");
            if !self.registry.fulfill(&key, outcome) {
                // Timed out while the body was being decoded.
                ConsumerMetrics::record_late_reply();
            }
        }
    }
}

async fn decode_reply(content_type: Option<String>, body: Vec<u8>) -> ResponseOutcome {
    let decoded = if is_compressed(content_type.as_deref()) {
        match tokio::task::spawn_blocking(move || inflate_to_string(&body)).await {
            Ok(decoded) => decoded,
            Err(e) => return ResponseOutcome::Failure(format!("decoding task failed: {e}")),
        }
    } else {
        decode_body(content_type.as_deref(), &body)
    };

    match decoded {
        Ok(payload) => ResponseOutcome::Success(payload),
        Err(e) => ResponseOutcome::Failure(format!("undecodable reply: {e}")),
    }
}

/// Decodes broadcast events into the event stream.
pub(crate) struct EventHandler {
    exchange: String,
    binding_key: String,
    names: BTreeSet<String>,
    sender: mpsc::Sender<ShardEvent>,
}

impl EventHandler {
    /// Bind to `exchange` with `binding_weight` and forward events named in
    /// `names` (all events when empty) to `sender`.
    pub(crate) fn new(
        exchange: impl Into<String>,
        binding_weight: u32,
        names: BTreeSet<String>,
        sender: mpsc::Sender<ShardEvent>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            binding_key: binding_weight.to_string(),
            names,
            sender,
        }
    }

    fn wanted(&self, event: &ShardEvent) -> bool {
        self.names.is_empty()
            || event
                .event
                .name
                .as_ref()
                .is_some_and(|name| self.names.contains(name))
    }
}

impl DeliveryHandler for EventHandler {
    const NAME: &'static str = "event";

    fn subscribe<'a>(
        &'a self,
        active: &'a ActiveChannel,
    ) -> impl Future<Output = Result<DeliveryStream, BrokerError>> + Send + 'a {
        async move {
            let queue = active.channel.declare_queue(QueueSpec::event_queue()).await?;
            active
                .channel
                .bind_queue(&queue, &self.exchange, &self.binding_key)
                .await?;
            tracing::debug!(
                queue = %queue,
                exchange = %self.exchange,
                binding_key = %self.binding_key,
                "Event queue bound"
            );
            active.channel.consume(&queue).await
        }
    }

    fn handle(self: Arc<Self>, delivery: Delivery) -> impl Future<Output = ()> + Send {
        async move {
            let content_type = delivery.properties.content_type;
            let body = delivery.body;
            let decoded = tokio::task::spawn_blocking(move || {
                let result = decode_event(content_type.as_deref(), &body);
                (result, body)
            })
            .await;

            let envelope = match decoded {
                Ok((Ok(envelope), _)) => envelope,
                Ok((Err(e), body)) => {
                    ConsumerMetrics::record_event_decode_failure();
                    tracing::error!(
                        error = %e,
                        body = %String::from_utf8_lossy(&body),
                        "Dropping undecodable event"
                    );
                    return;
                },
                Err(e) => {
                    ConsumerMetrics::record_event_decode_failure();
                    tracing::error!(error = %e, "Event decoding task failed");
                    return;
                },
            };

            let Some(event) = envelope.into_shard_event() else {
                tracing::debug!("Dropping event envelope without an event");
                return;
            };
            if !self.wanted(&event) {
                tracing::debug!(name = ?event.event.name, "Dropping filtered event");
                return;
            }

            ConsumerMetrics::record_event();
            if self.sender.send(event).await.is_err() {
                tracing::debug!("Event stream dropped, discarding event");
            }
        }
    }
}

/// Expose the receiving end of the event channel as an [`EventStream`].
pub(crate) fn event_stream(mut receiver: mpsc::Receiver<ShardEvent>) -> EventStream {
    Box::pin(async_stream::stream! {
        while let Some(event) = receiver.recv().await {
            yield event;
        }
    })
}
