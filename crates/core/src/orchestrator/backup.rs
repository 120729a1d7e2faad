//! Versioned storage snapshots

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tidemark_domain::constants::BACKUP_FORMAT_VERSION;

/// Storage snapshot plus the format version it was written with
///
/// `data` is the adapter's opaque backup blob; it serializes as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub data: Vec<u8>,
}

impl Backup {
    pub fn new(created_at: DateTime<Utc>, data: Vec<u8>) -> Self {
        Self { version: BACKUP_FORMAT_VERSION, created_at, data }
    }

    /// Whether this build can restore the backup
    pub fn is_supported(&self) -> bool {
        (1..=BACKUP_FORMAT_VERSION).contains(&self.version)
    }
}

fn to_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text).map_err(serde::de::Error::custom)
}
