//! Cached remote reads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Metadata;

/// Read-order policy between the cache and the remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Cache, then remote on miss
    #[default]
    CacheFirst,
    /// Remote, then cache if the remote call fails
    NetworkFirst,
    /// Cached value now, refreshed in the background
    StaleWhileRevalidate,
    CacheOnly,
    NetworkOnly,
}

crate::impl_domain_status_conversions!(CacheStrategy {
    CacheFirst => "cache-first",
    NetworkFirst => "network-first",
    StaleWhileRevalidate => "stale-while-revalidate",
    CacheOnly => "cache-only",
    NetworkOnly => "network-only",
});

/// Stored form of a cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum CachedValue {
    Plain(Value),
    /// Gzip-compressed JSON, base64 encoded
    Gzip(String),
}

/// One cache record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: CachedValue,
    pub created_at: u64,
    /// Never earlier than `created_at`
    pub expires_at: u64,
    pub strategy: CacheStrategy,
    pub hit_count: u64,
    pub last_accessed_at: u64,
    /// LRU tie-break for entries touched in the same millisecond
    #[serde(default)]
    pub access_sequence: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CacheEntry {
    /// An entry is expired strictly after `expires_at`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.value, CachedValue::Gzip(_))
    }

    /// LRU ordering key (oldest access first)
    pub fn recency(&self) -> (u64, u64) {
        (self.last_accessed_at, self.access_sequence)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(created_at: u64, ttl: u64) -> CacheEntry {
        CacheEntry {
            key: "weather".into(),
            value: CachedValue::Plain(json!({"temp": 21})),
            created_at,
            expires_at: created_at + ttl,
            strategy: CacheStrategy::default(),
            hit_count: 0,
            last_accessed_at: created_at,
            access_sequence: 0,
            size_bytes: 11,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let e = entry(0, 1_000);
        assert!(!e.is_expired(1_000));
        assert!(e.is_expired(1_001));
    }

    #[test]
    fn strategy_wire_names() {
        assert_eq!(CacheStrategy::StaleWhileRevalidate.to_string(), "stale-while-revalidate");
        assert_eq!(
            serde_json::to_value(CacheStrategy::NetworkFirst).unwrap(),
            json!("network-first")
        );
        assert_eq!("cache-only".parse::<CacheStrategy>(), Ok(CacheStrategy::CacheOnly));
    }

    #[test]
    fn cached_value_is_tagged_by_encoding() {
        let plain = serde_json::to_value(CachedValue::Plain(json!([1, 2]))).unwrap();
        assert_eq!(plain, json!({"encoding": "plain", "data": [1, 2]}));

        let gz: CachedValue =
            serde_json::from_value(json!({"encoding": "gzip", "data": "H4sI"})).unwrap();
        assert_eq!(gz, CachedValue::Gzip("H4sI".into()));
    }

    #[test]
    fn recency_orders_by_access_then_sequence() {
        let mut a = entry(0, 10);
        let mut b = entry(0, 10);
        a.access_sequence = 2;
        b.access_sequence = 1;
        assert!(b.recency() < a.recency());
        assert!(!a.is_compressed());
    }
}
