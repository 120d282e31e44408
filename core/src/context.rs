//! Per-event processing context and its memo cache.
//!
//! Handling one inbound event often triggers the same lookup several times
//! (the same member, the same guild). An [`EventContext`] is created for each
//! event and passed explicitly to everything that handles it; its
//! [`ContextCache`] guarantees at most one upstream call per key for the
//! lifetime of that context. The cache is dropped with the context, so nothing
//! ever leaks from one event to the next.
//!
//! ```
//! use shardlink_core::context::{CacheKey, EventContext};
//! use shardlink_core::routing::ShardId;
//!
//! # tokio_test::block_on(async {
//! let ctx = EventContext::new(None, ShardId::new(0), None);
//! let key = CacheKey::new("user").push(42_u64);
//!
//! let first: Option<String> = ctx.cache().get_or_compute(&key, || async { None }).await;
//! let second: Option<String> = ctx
//!     .cache()
//!     .get_or_compute(&key, || async { Some("never called".to_string()) })
//!     .await;
//!
//! // A stored "absent" result is still a hit.
//! assert_eq!(first, second);
//! # });
//! ```

use crate::event::ShardEvent;
use crate::routing::ShardId;
use crate::snowflake::Snowflake;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

/// Deterministic cache key: an operation name followed by identifier parts,
/// joined with dots (`member.<guild>.<user>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start a key for `operation`.
    #[must_use]
    pub fn new(operation: &str) -> Self {
        Self(operation.to_string())
    }

    /// Append one identifier component.
    #[must_use]
    pub fn push(mut self, part: impl fmt::Display) -> Self {
        self.0.push('.');
        self.0.push_str(&part.to_string());
        self
    }

    /// The rendered key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Memo store scoped to one [`EventContext`].
///
/// Entries are typed: the same key looked up as two different value types
/// yields two independent entries. Each entry is a single-initialization cell,
/// so concurrent lookups of one key share a single computation. A failed
/// computation leaves the entry empty and the next lookup tries again.
#[derive(Default)]
pub struct ContextCache {
    entries: Mutex<HashMap<(CacheKey, TypeId), Slot>>,
}

impl ContextCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored value for `key`, computing and storing it first if
    /// this context has not seen the key yet.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &CacheKey, compute: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let result: Result<T, Infallible> = self
            .get_or_try_compute(key, || async { Ok(compute().await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`get_or_compute`](Self::get_or_compute).
    ///
    /// Only successful results are stored.
    ///
    /// # Errors
    ///
    /// Returns whatever `compute` returns when it fails.
    pub async fn get_or_try_compute<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(cell) = self.cell::<T>(key) else {
            tracing::warn!(key = %key, "Cache entry holds an unexpected type, computing without caching");
            return compute().await;
        };
        cell.get_or_try_init(compute).await.cloned()
    }

    /// Whether a value is stored for `key` as type `T`.
    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self, key: &CacheKey) -> bool {
        let slot = self.lock().get(&(key.clone(), TypeId::of::<T>())).cloned();
        slot.and_then(|slot| slot.downcast::<OnceCell<T>>().ok())
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of keys looked up in this context.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been looked up yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn cell<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<OnceCell<T>>> {
        let slot = {
            let mut entries = self.lock();
            Arc::clone(
                entries
                    .entry((key.clone(), TypeId::of::<T>()))
                    .or_insert_with(|| Arc::new(OnceCell::<T>::new())),
            )
        };
        slot.downcast::<OnceCell<T>>().ok()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(CacheKey, TypeId), Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ContextCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// Everything known about the event currently being processed.
///
/// Passed by reference to every handler of that event; dropped when processing
/// completes.
#[derive(Debug)]
pub struct EventContext {
    guild_id: Option<Snowflake>,
    shard_id: ShardId,
    bot_id: Option<Snowflake>,
    cache: ContextCache,
}

impl EventContext {
    /// Create a context with an empty cache.
    #[must_use]
    pub fn new(guild_id: Option<Snowflake>, shard_id: ShardId, bot_id: Option<Snowflake>) -> Self {
        Self {
            guild_id,
            shard_id,
            bot_id,
            cache: ContextCache::new(),
        }
    }

    /// Create the context for processing `event`.
    #[must_use]
    pub fn for_event(event: &ShardEvent, bot_id: Option<Snowflake>) -> Self {
        Self::new(event.event.guild_id(), event.shard_id, bot_id)
    }

    /// Guild owning the event, if any.
    #[must_use]
    pub const fn guild_id(&self) -> Option<Snowflake> {
        self.guild_id
    }

    /// Shard the event arrived on.
    #[must_use]
    pub const fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// The bot's own id.
    #[must_use]
    pub const fn bot_id(&self) -> Option<Snowflake> {
        self.bot_id
    }

    /// This context's memo cache.
    #[must_use]
    pub const fn cache(&self) -> &ContextCache {
        &self.cache
    }
}
