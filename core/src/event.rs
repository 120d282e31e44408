//! Broadcast event envelopes.
//!
//! Gateway workers fan domain events out on the event exchange wrapped in
//! an [`EventEnvelope`]. The event payload itself is opaque JSON owned by the
//! entity layer; only the fields needed for routing and filtering are typed.

use crate::routing::ShardId;
use crate::snowflake::Snowflake;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names whose guild id is the payload's own `id`.
const GUILD_LIFECYCLE_EVENTS: [&str; 3] = ["GUILD_CREATE", "GUILD_UPDATE", "GUILD_DELETE"];

/// Wire shape of a broadcast delivery: `{ "shard_id": 0, "event": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Shard the event originated on
    pub shard_id: u32,
    /// The gateway event, absent when the worker could not represent it
    #[serde(default)]
    pub event: Option<GatewayEvent>,
}

impl EventEnvelope {
    /// Split into a [`ShardEvent`], or `None` when no event is carried.
    #[must_use]
    pub fn into_shard_event(self) -> Option<ShardEvent> {
        let shard_id = ShardId::new(self.shard_id);
        self.event.map(|event| ShardEvent { shard_id, event })
    }
}

/// A raw gateway dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Dispatch name, such as `MESSAGE_CREATE`
    #[serde(rename = "t", default)]
    pub name: Option<String>,
    /// Gateway opcode
    #[serde(rename = "op", default)]
    pub opcode: Option<u8>,
    /// Sequence number
    #[serde(rename = "s", default)]
    pub sequence: Option<u64>,
    /// Event payload
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl GatewayEvent {
    /// The guild this event belongs to, if any.
    ///
    /// Guild lifecycle events carry the guild as their payload, so its `id`
    /// is used; everything else is read from `guild_id`.
    #[must_use]
    pub fn guild_id(&self) -> Option<Snowflake> {
        let field = match self.name.as_deref() {
            Some(name) if GUILD_LIFECYCLE_EVENTS.contains(&name) => "id",
            _ => "guild_id",
        };
        self.data
            .get(field)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Whether the dispatch name is `name`.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// An event together with the shard it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardEvent {
    /// Originating shard
    pub shard_id: ShardId,
    /// The event
    pub event: GatewayEvent,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, data: Value) -> GatewayEvent {
        GatewayEvent {
            name: Some(name.to_string()),
            opcode: Some(0),
            sequence: Some(1),
            data,
        }
    }

    #[test]
    fn guild_id_comes_from_guild_id_field() {
        let e = event("MESSAGE_CREATE", json!({ "id": "1", "guild_id": "41771983423143937" }));
        assert_eq!(e.guild_id(), Some(Snowflake::new(41_771_983_423_143_937)));
    }

    #[test]
    fn guild_lifecycle_events_use_their_own_id() {
        for name in GUILD_LIFECYCLE_EVENTS {
            let e = event(name, json!({ "id": "99", "name": "test" }));
            assert_eq!(e.guild_id(), Some(Snowflake::new(99)), "{name}");
        }
    }

    #[test]
    fn direct_message_events_have_no_guild() {
        let e = event("MESSAGE_CREATE", json!({ "id": "1", "channel_id": "2" }));
        assert_eq!(e.guild_id(), None);
    }

    #[test]
    fn envelope_without_event_yields_nothing() {
        let envelope: EventEnvelope = serde_json::from_str(r#"{"shard_id":2}"#).unwrap();
        assert_eq!(envelope.shard_id, 2);
        assert!(envelope.into_shard_event().is_none());
    }

    #[test]
    fn envelope_splits_into_shard_event() {
        let envelope: EventEnvelope = serde_json::from_value(json!({
            "shard_id": 5,
            "event": { "op": 0, "t": "GUILD_CREATE", "s": 42, "d": { "id": "7" } }
        }))
        .unwrap();

        let shard_event = envelope.into_shard_event().unwrap();
        assert_eq!(shard_event.shard_id, ShardId::new(5));
        assert!(shard_event.event.is_named("GUILD_CREATE"));
        assert_eq!(shard_event.event.sequence, Some(42));
    }
}
