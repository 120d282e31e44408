//! Error taxonomy for shard RPC operations.
//!
//! Every failure surfaced to a caller of the request path is one of the
//! [`RpcError`] variants. Absent data is *not* an error: lookups return
//! `Ok(None)` when the remote side answers "not found".

use crate::broker::BrokerError;
use crate::codec::DecodeError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by shard RPC operations.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// Invalid configuration or malformed identifiers.
    ///
    /// Fatal to the calling operation and never retried internally.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The broker is unreachable, the channel is unusable or a publish failed.
    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    /// No reply arrived within the request window.
    #[error(
        "The cache did not respond in time (request {correlation_id}, waited {timeout:?}). \
         Consider increasing the timeout?"
    )]
    Timeout {
        /// Correlation key of the abandoned request
        correlation_id: String,
        /// The window that elapsed
        timeout: Duration,
    },

    /// The remote side reported a non-success, non-not-found status, or sent
    /// a reply that could not be decoded.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A payload could not be decoded on this side of the exchange.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

impl RpcError {
    /// Whether this error is a request timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error came from the transport.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether the remote side reported the failure.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(DecodeError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_correlation_id() {
        let err = RpcError::Timeout {
            correlation_id: "req-7".to_string(),
            timeout: Duration::from_millis(500),
        };
        let message = err.to_string();
        assert!(message.contains("req-7"));
        assert!(message.contains("did not respond in time"));
        assert!(err.is_timeout());
        assert!(!err.is_transport());
    }

    #[test]
    fn broker_errors_convert_to_transport() {
        let err: RpcError = BrokerError::ChannelUnavailable.into();
        assert!(err.is_transport());
    }
}
