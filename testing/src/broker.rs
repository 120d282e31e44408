//! In-memory broker.
//!
//! Implements the [`Broker`] seam with just enough AMQP behaviour for the
//! request/response protocol:
//!
//! - direct and fanout exchanges, plus the default exchange (`""`) routing
//!   straight to the queue named by the routing key
//! - server-named queues (`amq.gen-N`) with a single consumer each
//! - queues are owned by the channel that declared them and disappear with it
//! - unroutable messages are dropped
//!
//! Several [`InMemoryBroker`] handles can share one broker (see
//! [`InMemoryBroker::connection`]); each handle stands for one client
//! connection and carries its own fault-injection switches.

#![allow(clippy::missing_panics_doc)]

use shardlink_core::broker::{
    Broker, BrokerChannel, BrokerError, BrokerFuture, Delivery, DeliveryStream, MessageProperties,
    QueueSpec,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How an exchange routes messages to its bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues whose binding key equals the routing key
    Direct,
    /// Deliver to every bound queue
    Fanout,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct Queue {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    bindings: Mutex<Vec<Binding>>,
    queues: Mutex<HashMap<String, Queue>>,
    published: Mutex<Vec<Delivery>>,
    next_queue: AtomicU64,
}

impl BrokerState {
    fn route(&self, delivery: Delivery) {
        let targets: Vec<String> = if delivery.exchange.is_empty() {
            vec![delivery.routing_key.clone()]
        } else {
            let kind = lock(&self.exchanges)
                .get(&delivery.exchange)
                .copied()
                .unwrap_or(ExchangeKind::Direct);
            lock(&self.bindings)
                .iter()
                .filter(|b| b.exchange == delivery.exchange)
                .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == delivery.routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        lock(&self.published).push(delivery.clone());

        let queues = lock(&self.queues);
        let mut routed = false;
        for name in targets {
            if let Some(queue) = queues.get(&name) {
                routed |= queue.sender.send(delivery.clone()).is_ok();
            }
        }
        if !routed {
            tracing::debug!(
                exchange = %delivery.exchange,
                routing_key = %delivery.routing_key,
                "Dropping unroutable message"
            );
        }
    }

    fn delete_queues(&self, names: &[String]) {
        let mut queues = lock(&self.queues);
        for name in names {
            queues.remove(name);
        }
        lock(&self.bindings).retain(|b| !names.contains(&b.queue));
    }
}

#[derive(Default)]
struct ConnectionState {
    channels: Mutex<Vec<Arc<ChannelState>>>,
    channels_opened: AtomicUsize,
    fail_publish: AtomicBool,
    fail_open: AtomicBool,
    open_delay: Mutex<Duration>,
}

struct ChannelState {
    closed: watch::Sender<bool>,
    queues: Mutex<Vec<String>>,
}

impl ChannelState {
    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

/// In-memory [`Broker`] for tests.
///
/// # Example
///
/// ```
/// use shardlink_core::broker::{Broker, MessageProperties, QueueSpec};
/// use shardlink_testing::InMemoryBroker;
/// use futures::StreamExt;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let channel = broker.open_channel().await?;
/// let queue = channel.declare_queue(QueueSpec::reply_queue()).await?;
/// let mut deliveries = channel.consume(&queue).await?;
///
/// channel.publish("", &queue, MessageProperties::default(), b"hi".to_vec()).await?;
/// let delivery = deliveries.next().await.unwrap()?;
/// assert_eq!(delivery.body, b"hi");
/// # Ok::<(), shardlink_core::broker::BrokerError>(())
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
}

impl InMemoryBroker {
    /// Create an empty broker with one connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            connection: Arc::new(ConnectionState::default()),
        }
    }

    /// Open another connection to the same broker.
    ///
    /// Fault injection on the returned handle does not affect this one.
    #[must_use]
    pub fn connection(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            connection: Arc::new(ConnectionState::default()),
        }
    }

    /// Declare `name` with the given routing behaviour.
    ///
    /// Exchanges that are never declared behave as direct exchanges.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        lock(&self.state.exchanges).insert(name.to_string(), kind);
    }

    /// Make every publish on this connection fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.connection.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make opening channels on this connection fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.connection.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make opening channels on this connection take `delay` first.
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.connection.open_delay) = delay;
    }

    /// Close every open channel of this connection from the broker side.
    ///
    /// Their queues are deleted and their consumers' streams end.
    pub fn kill_channels(&self) {
        let channels: Vec<Arc<ChannelState>> = lock(&self.connection.channels).drain(..).collect();
        for channel in channels {
            close_channel(&self.state, &channel);
        }
    }

    /// Number of channels opened on this connection so far.
    #[must_use]
    pub fn channels_opened(&self) -> usize {
        self.connection.channels_opened.load(Ordering::SeqCst)
    }

    /// Every message published to the broker, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<Delivery> {
        lock(&self.state.published).clone()
    }

    /// Messages published to `exchange`, in publish order.
    #[must_use]
    pub fn published_to(&self, exchange: &str) -> Vec<Delivery> {
        lock(&self.state.published)
            .iter()
            .filter(|d| d.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Whether a queue named `name` currently exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state.queues).contains_key(name)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for InMemoryBroker {
    fn open_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            let delay = *lock(&self.connection.open_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.connection.fail_open.load(Ordering::SeqCst) {
                return Err(BrokerError::ChannelOpenFailed(
                    "connection refused by test".to_string(),
                ));
            }

            let (closed, _) = watch::channel(false);
            let channel = Arc::new(ChannelState {
                closed,
                queues: Mutex::new(Vec::new()),
            });
            lock(&self.connection.channels).push(Arc::clone(&channel));
            self.connection.channels_opened.fetch_add(1, Ordering::SeqCst);

            Ok(Arc::new(InMemoryChannel {
                state: Arc::clone(&self.state),
                connection: Arc::clone(&self.connection),
                channel,
            }) as Arc<dyn BrokerChannel>)
        })
    }
}

/// A channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    state: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    channel: Arc<ChannelState>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.channel.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed("channel is closed".to_string()))
        }
    }
}

impl BrokerChannel for InMemoryChannel {
    fn declare_queue(&self, spec: QueueSpec) -> BrokerFuture<'_, String> {
        Box::pin(async move {
            self.ensure_open()?;

            let name = if spec.name.is_empty() {
                let n = self.state.next_queue.fetch_add(1, Ordering::SeqCst) + 1;
                format!("amq.gen-{n}")
            } else {
                spec.name
            };

            let mut queues = lock(&self.state.queues);
            if !queues.contains_key(&name) {
                let (sender, receiver) = mpsc::unbounded_channel();
                queues.insert(
                    name.clone(),
                    Queue {
                        sender,
                        receiver: Some(receiver),
                    },
                );
                lock(&self.channel.queues).push(name.clone());
            }
            Ok(name)
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if !lock(&self.state.queues).contains_key(queue) {
                return Err(BrokerError::BindFailed {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "no such queue".to_string(),
                });
            }
            lock(&self.state.bindings).push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.connection.fail_publish.load(Ordering::SeqCst) {
                return Err(BrokerError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "publish rejected by test".to_string(),
                });
            }

            self.state.route(Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties,
                body,
            });
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            let receiver = lock(&self.state.queues)
                .get_mut(queue)
                .and_then(|q| q.receiver.take());
            let Some(mut receiver) = receiver else {
                return Err(BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "no such queue, or it already has a consumer".to_string(),
                });
            };

            let mut closed = self.channel.closed.subscribe();
            let stream = async_stream::stream! {
                loop {
                    let next = tokio::select! {
                        delivery = receiver.recv() => delivery,
                        () = wait_closed(&mut closed) => None,
                    };
                    match next {
                        Some(delivery) => yield Ok(delivery),
                        None => break,
                    }
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            lock(&self.connection.channels).retain(|c| !Arc::ptr_eq(c, &self.channel));
            close_channel(&self.state, &self.channel);
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

fn close_channel(state: &BrokerState, channel: &ChannelState) {
    channel.closed.send_replace(true);
    let owned: Vec<String> = lock(&channel.queues).drain(..).collect();
    state.delete_queues(&owned);
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
