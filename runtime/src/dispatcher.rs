//! Request dispatcher.
//!
//! One publish, one wait, one outcome. The dispatcher never retries; callers
//! that want another attempt use [`crate::retry`].

use crate::connection::ConnectionManager;
use crate::metrics::RequestMetrics;
use crate::registry::CorrelationRegistry;
use shardlink_core::RpcError;
use shardlink_core::broker::MessageProperties;
use shardlink_core::codec::encode_request;
use shardlink_core::request::CacheRequest;
use shardlink_core::response::ResponseOutcome;
use shardlink_core::routing::ShardId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Publishes requests and waits for their correlated replies.
pub struct RequestDispatcher {
    connection: Arc<ConnectionManager>,
    registry: Arc<CorrelationRegistry>,
    exchange: String,
}

impl RequestDispatcher {
    /// Dispatch requests to `exchange` over `connection`, correlating replies
    /// through `registry`.
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<CorrelationRegistry>,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            registry,
            exchange: exchange.into(),
        }
    }

    /// Send `request` to `shard` and wait up to `timeout` for the reply.
    ///
    /// Returns `Ok(None)` when the remote side reports the entity as not
    /// found.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Decode`] if the request cannot be encoded
    /// - [`RpcError::Transport`] if there is no usable channel or the publish fails
    /// - [`RpcError::Timeout`] if no reply arrives in time
    /// - [`RpcError::Remote`] if the reply reports a failure or cannot be decoded
    pub async fn dispatch(
        &self,
        shard: ShardId,
        request: &CacheRequest,
        timeout: Duration,
    ) -> Result<Option<String>, RpcError> {
        let kind = request.name();
        let started = Instant::now();
        let result = self.exchange_once(shard, request, timeout).await;

        let outcome = match &result {
            Ok(Some(_)) => "success",
            Ok(None) => "not_found",
            Err(RpcError::Timeout { .. }) => "timeout",
            Err(RpcError::Remote(_)) => "remote_error",
            Err(RpcError::Transport(_)) => "transport_error",
            Err(_) => "error",
        };
        RequestMetrics::record(kind, outcome, started.elapsed());

        result
    }

    async fn exchange_once(
        &self,
        shard: ShardId,
        request: &CacheRequest,
        timeout: Duration,
    ) -> Result<Option<String>, RpcError> {
        let body = encode_request(request)?;

        // Registered before publishing so a fast reply always finds its entry.
        let pending = self.registry.register();
        let active = self.connection.current().await?;

        let properties = MessageProperties::default()
            .with_correlation_id(pending.key())
            .with_reply_to(active.reply_queue.as_str());
        let routing_key = shard.routing_key();

        tracing::debug!(
            correlation_id = %pending.key(),
            shard = %shard,
            kind = request.name(),
            "Publishing request"
        );
        active
            .publish(&self.exchange, &routing_key, properties, body)
            .await?;

        let correlation_id = pending.key().to_string();
        match pending.wait(timeout).await {
            None => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    shard = %shard,
                    timeout_ms = timeout.as_millis(),
                    "Request timed out"
                );
                Err(RpcError::Timeout {
                    correlation_id,
                    timeout,
                })
            },
            Some(ResponseOutcome::Success(payload)) => Ok(Some(payload)),
            Some(ResponseOutcome::NotFound) => Ok(None),
            Some(ResponseOutcome::Failure(reason)) => {
                tracing::debug!(correlation_id = %correlation_id, reason = %reason, "Request failed remotely");
                Err(RpcError::Remote(reason))
            },
        }
    }
}
