//! Serde adapters for `Duration` fields stored as integer milliseconds
//!
//! Engine configuration and persisted records keep every duration as a plain
//! millisecond count so TOML files, environment overrides and JSON snapshots
//! all agree on one unit.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use serde::{Deserialize, Serialize};
//! use tidemark_common::duration_millis;
//!
//! #[derive(Serialize, Deserialize)]
//! struct DrainSettings {
//!     #[serde(with = "duration_millis")]
//!     interval: Duration,
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde result type
type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

fn to_millis(duration: &Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `Duration` <-> `u64` milliseconds
pub mod duration_millis {
    use super::*;

    /// Serialize a Duration as milliseconds
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(to_millis(duration))
    }

    /// Deserialize milliseconds into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// `Option<Duration>` <-> nullable `u64` milliseconds
pub mod option_duration_millis {
    use super::*;

    /// Serialize an optional Duration as milliseconds or null
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&to_millis(d)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize nullable milliseconds into an optional Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
