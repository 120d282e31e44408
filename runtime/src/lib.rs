//! # Shardlink Runtime
//!
//! Request/response over a message broker for sharded cache workers.
//!
//! The broker only offers fire-and-forget publish/subscribe. This crate turns
//! it into timeout-bounded request/response: every request carries a fresh
//! correlation key and the name of a private reply queue, and the reply
//! consumer hands each reply to the caller waiting on that key.
//!
//! ## Core Components
//!
//! - **[`CacheClient`]**: Starts everything and exposes typed lookups
//! - **Connection Manager**: Owns the channel and reply queue, recreated on demand
//! - **Correlation Registry**: Outstanding requests keyed by correlation key
//! - **Request Dispatcher**: One publish, one wait, one classified outcome
//! - **Consumers**: Replies fulfill pending requests; events feed an [`EventStream`]
//! - **[`ContextualSupplier`]**: Lookups memoized for one event
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use shardlink_core::context::EventContext;
//! use shardlink_runtime::{CacheClient, ClientConfig, ContextualSupplier};
//! use shardlink_testing::InMemoryBroker;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), shardlink_core::RpcError> {
//! let config = ClientConfig::from_env()?;
//! let (client, mut events) = CacheClient::start(Arc::new(InMemoryBroker::new()), config).await?;
//!
//! while let Some(event) = events.next().await {
//!     let context = EventContext::for_event(&event, None);
//!     let supplier = ContextualSupplier::new(&client, &context);
//!     let guild: Option<serde_json::Value> = supplier.guild().await?;
//! }
//! # Ok(())
//! # }
//! ```

/// Cache client facade
pub mod client;

/// Client configuration
pub mod config;

/// Channel and reply queue ownership
pub mod connection;

/// Reply and event consumers
pub mod consumer;

/// Request publishing and reply classification
pub mod dispatcher;

/// Prometheus metrics for observability
pub mod metrics;

/// Outstanding requests by correlation key
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

/// Per-event memoized lookups
pub mod supplier;

pub use client::CacheClient;
pub use config::ClientConfig;
pub use consumer::EventStream;
pub use metrics::MetricsServer;
pub use retry::RetryPolicy;
pub use supplier::ContextualSupplier;
