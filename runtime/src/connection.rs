//! Connection manager.
//!
//! Owns the live channel and its private reply queue. The pair is replaced
//! wholesale by [`ConnectionManager::open_channel`]; replacements are
//! serialized so two concurrent recoveries cannot both leave a live channel
//! behind, and publishes issued meanwhile wait briefly for the new channel or
//! fail fast with a transport error.
//!
//! Every replacement is announced on a watch channel. The consumers follow it
//! to re-register themselves on the new channel.

use shardlink_core::broker::{
    Broker, BrokerChannel, BrokerError, MessageProperties, QueueSpec,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};

/// The channel currently in use, with the reply queue declared on it.
#[derive(Clone)]
pub struct ActiveChannel {
    /// The channel
    pub channel: Arc<dyn BrokerChannel>,
    /// Server-assigned name of the reply queue
    pub reply_queue: String,
    /// Increases by one each time the channel is replaced
    pub generation: u64,
}

impl ActiveChannel {
    /// Publish on this channel.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the channel rejects the message.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.channel.publish(exchange, routing_key, properties, body).await
    }
}

impl std::fmt::Debug for ActiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveChannel")
            .field("reply_queue", &self.reply_queue)
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Owns the broker connection's active channel and reply queue.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    active: RwLock<Option<ActiveChannel>>,
    announcements: watch::Sender<Option<ActiveChannel>>,
    generation: AtomicU64,
    recovery_wait: Duration,
}

impl ConnectionManager {
    /// Create a manager over `broker`. No channel is opened yet.
    ///
    /// Publishes wait up to `recovery_wait` for a channel that is being
    /// replaced.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, recovery_wait: Duration) -> Self {
        let (announcements, _) = watch::channel(None);
        Self {
            broker,
            active: RwLock::new(None),
            announcements,
            generation: AtomicU64::new(0),
            recovery_wait,
        }
    }

    /// Replace the current channel (if any) with a fresh channel and reply
    /// queue.
    ///
    /// Failures while closing the old channel are ignored; it may already be
    /// dead. If the new channel cannot be set up, no channel is left active.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the channel cannot be opened or the reply
    /// queue cannot be declared.
    pub async fn open_channel(&self) -> Result<ActiveChannel, BrokerError> {
        let mut active = self.active.write().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = active.take() {
            if let Err(e) = old.channel.close().await {
                tracing::debug!(
                    generation = old.generation,
                    error = %e,
                    "Ignoring failure to close previous channel"
                );
            }
        }

        let result = async {
            let channel = self.broker.open_channel().await?;
            let reply_queue = channel.declare_queue(QueueSpec::reply_queue()).await?;
            Ok::<_, BrokerError>(ActiveChannel {
                channel,
                reply_queue,
                generation,
            })
        }
        .await;

        match result {
            Ok(fresh) => {
                tracing::info!(
                    queue = %fresh.reply_queue,
                    generation,
                    "Channel and reply queue ready"
                );
                *active = Some(fresh.clone());
                self.announcements.send_replace(Some(fresh.clone()));
                Ok(fresh)
            },
            Err(e) => {
                tracing::warn!(generation, error = %e, "Failed to open channel");
                self.announcements.send_replace(None);
                Err(e)
            },
        }
    }

    /// The channel to publish on.
    ///
    /// Waits up to the recovery wait while the channel is being replaced.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelUnavailable`] if no channel is active
    /// (or the replacement takes too long) and [`BrokerError::ChannelClosed`]
    /// if the active channel has died.
    pub async fn current(&self) -> Result<ActiveChannel, BrokerError> {
        let guard = tokio::time::timeout(self.recovery_wait, self.active.read())
            .await
            .map_err(|_| BrokerError::ChannelUnavailable)?;
        let active = (*guard).clone().ok_or(BrokerError::ChannelUnavailable)?;
        drop(guard);

        if active.channel.is_open() {
            Ok(active)
        } else {
            Err(BrokerError::ChannelClosed(
                "the active channel has closed; recover the connection".to_string(),
            ))
        }
    }

    /// Publish on the current channel.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if no usable channel is available or the
    /// publish fails.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.current()
            .await?
            .publish(exchange, routing_key, properties, body)
            .await
    }

    /// Follow channel replacements.
    ///
    /// The receiver starts at the current channel (or `None`).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveChannel>> {
        self.announcements.subscribe()
    }

    /// Name of the current reply queue, if a channel is active.
    pub async fn reply_queue(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|active| active.reply_queue.clone())
    }

    /// Close the active channel. Close failures are ignored.
    pub async fn close(&self) {
        let mut active = self.active.write().await;
        if let Some(old) = active.take() {
            if let Err(e) = old.channel.close().await {
                tracing::debug!(error = %e, "Ignoring failure to close channel");
            }
            tracing::info!(generation = old.generation, "Channel closed");
        }
        self.announcements.send_replace(None);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use shardlink_testing::InMemoryBroker;

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn publish_without_channel_fails_fast() {
        let broker = InMemoryBroker::new();
        let connection = manager(&broker);

        let err = connection
            .publish("cache", "0", MessageProperties::default(), Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::ChannelUnavailable);
    }

    #[tokio::test]
    async fn reopening_replaces_channel_and_queue() {
        let broker = InMemoryBroker::new();
        let connection = manager(&broker);

        let first = connection.open_channel().await.unwrap();
        let second = connection.open_channel().await.unwrap();

        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_ne!(first.reply_queue, second.reply_queue);
        assert!(!first.channel.is_open());
        assert!(!broker.has_queue(&first.reply_queue));
        assert!(broker.has_queue(&second.reply_queue));
    }

    #[tokio::test]
    async fn reopening_after_broker_killed_the_channel() {
        let broker = InMemoryBroker::new();
        let connection = manager(&broker);
        connection.open_channel().await.unwrap();

        broker.kill_channels();
        assert!(matches!(
            connection.current().await,
            Err(BrokerError::ChannelClosed(_))
        ));

        connection.open_channel().await.unwrap();
        assert!(connection.current().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_reopens_leave_one_live_channel() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(manager(&broker));

        let a = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.open_channel().await.unwrap() }
        });
        let b = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.open_channel().await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(u8::from(a.channel.is_open()) + u8::from(b.channel.is_open()), 1);
        assert_eq!(connection.current().await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn failed_reopen_leaves_no_channel() {
        let broker = InMemoryBroker::new();
        let connection = manager(&broker);
        connection.open_channel().await.unwrap();

        broker.set_fail_open(true);
        assert!(connection.open_channel().await.is_err());
        assert_eq!(connection.current().await.unwrap_err(), BrokerError::ChannelUnavailable);
        assert!(connection.subscribe().borrow().is_none());
    }

    #[tokio::test]
    async fn publish_during_slow_replacement_fails_after_the_recovery_wait() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(manager(&broker));
        connection.open_channel().await.unwrap();

        broker.set_open_delay(Duration::from_millis(300));
        let reopen = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.open_channel().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let err = connection
            .publish("cache", "0", MessageProperties::default(), Vec::new())
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert_eq!(err, BrokerError::ChannelUnavailable);
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(250));
        assert!(broker.published_to("cache").is_empty());

        reopen.await.unwrap().unwrap();
        assert_eq!(connection.current().await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn replacements_are_announced() {
        let broker = InMemoryBroker::new();
        let connection = manager(&broker);
        let mut announcements = connection.subscribe();

        connection.open_channel().await.unwrap();
        announcements.changed().await.unwrap();
        assert_eq!(announcements.borrow().as_ref().unwrap().generation, 1);
    }
}
