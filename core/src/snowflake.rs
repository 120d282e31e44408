//! Snowflake identifiers.
//!
//! Every entity handled by the cache workers (guilds, users, channels, ...) is
//! addressed by a 64-bit Snowflake. The upper 42 bits encode a millisecond
//! timestamp, which is what the [`routing`](crate::routing) module relies on
//! to spread entities across shards.
//!
//! On the wire Snowflakes travel as decimal strings, but numeric JSON values
//! are accepted when decoding.

use crate::error::RpcError;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 64-bit entity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Snowflake(u64);

impl Snowflake {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw 64-bit value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Derive the bot's own id from its token.
    ///
    /// A bot token is three dot-separated segments; the first one is the
    /// base64 encoding of the bot's id as a decimal string.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Configuration`] if the first segment is not valid
    /// base64 or does not decode to a decimal identifier.
    pub fn from_bot_token(token: &str) -> Result<Self, RpcError> {
        let malformed = || {
            RpcError::Configuration(
                "Malformed bot token. Make sure that your token is correct.".to_string(),
            )
        };

        let segment = token.split('.').next().unwrap_or_default();
        if segment.is_empty() {
            return Err(malformed());
        }

        let bytes = STANDARD
            .decode(segment)
            .or_else(|_| STANDARD_NO_PAD.decode(segment))
            .map_err(|_| malformed())?;
        let text = String::from_utf8(bytes).map_err(|_| malformed())?;
        text.parse().map_err(|_| malformed())
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Snowflake> for u64 {
    fn from(value: Snowflake) -> Self {
        value.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| RpcError::Configuration(format!("Invalid snowflake '{s}': {e}")))
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a snowflake as a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Snowflake(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(Snowflake)
                    .map_err(|_| E::custom(format!("negative snowflake: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse::<u64>().map(Snowflake).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}
