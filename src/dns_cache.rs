//! DNS response cache (C5)
//!
//! Bounded, TTL-respecting cache of successful DNS responses, keyed by
//! lowercased query name and record type. Grounded on the RwLock-guarded
//! timestamp-cache pattern used elsewhere in the pack for a single cached
//! boolean, generalized here to a full response map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hickory_proto::rr::RecordType;
use tokio::sync::RwLock;

use crate::config::DnsCacheConfig;

#[derive(Debug, Clone)]
struct CacheEntry {
    response: Vec<u8>,
    expires_at: Instant,
    original_min_ttl: u32,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    qname: String,
    qtype: u16,
}

/// TTL-bounded response cache. Reads take a shared lock; insertion and
/// eviction take an exclusive lock.
pub struct DnsCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    config: DnsCacheConfig,
}

impl DnsCache {
    pub fn new(config: DnsCacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns a copy of the cached response with its TTLs clamped to the
    /// remaining cache lifetime, or `None` on a miss or expiry.
    pub async fn get(&self, qname: &str, qtype: RecordType) -> Option<(Vec<u8>, u32)> {
        let key = CacheKey {
            qname: qname.to_ascii_lowercase(),
            qtype: u16::from(qtype),
        };

        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;

        let now = Instant::now();
        if entry.expires_at <= now {
            return None;
        }

        let remaining = entry.expires_at.saturating_duration_since(now).as_secs() as u32;
        Some((entry.response.clone(), remaining))
    }

    /// Stores a response with the computed effective TTL (seconds). A TTL
    /// of 0 after clamping means "do not cache" and is a no-op.
    pub async fn put(&self, qname: &str, qtype: RecordType, response: Vec<u8>, effective_ttl: u32) {
        if effective_ttl == 0 {
            return;
        }

        let key = CacheKey {
            qname: qname.to_ascii_lowercase(),
            qtype: u16::from(qtype),
        };
        let entry = CacheEntry {
            response,
            expires_at: Instant::now() + Duration::from_secs(effective_ttl as u64),
            original_min_ttl: effective_ttl,
        };

        let mut entries = self.entries.write().await;
        entries.insert(key, entry);

        if entries.len() > self.config.hard_cap {
            evict_fraction(&mut entries, 4);
        }
    }

    /// Clamps a raw minimum TTL per spec §4.3's caching rules. Returns 0
    /// when the result means "do not cache".
    pub fn clamp_ttl(&self, raw_min_ttl: u32) -> u32 {
        let mut ttl = raw_min_ttl;

        if ttl == 0 {
            if let Some(default_min) = self.config.default_min_ttl_secs {
                ttl = default_min;
            }
        }

        if let Some(min_override) = self.config.min_ttl_override_secs {
            if ttl < min_override {
                ttl = min_override;
            }
        }

        if let Some(max_override) = self.config.max_ttl_override_secs {
            if ttl > max_override {
                ttl = max_override;
            }
        }

        ttl
    }

    /// Periodic sweep: removes expired entries. Run on a fixed interval by
    /// the supervisor's cache-eviction loop.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Removes roughly `1/fraction` of entries in arbitrary (HashMap-iteration)
/// order, used when the hard cap is exceeded.
fn evict_fraction(entries: &mut HashMap<CacheKey, CacheEntry>, fraction: usize) {
    let to_remove = entries.len() / fraction;
    if to_remove == 0 {
        return;
    }

    let keys: Vec<CacheKey> = entries.keys().take(to_remove).cloned().collect();
    for key in keys {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_cap(hard_cap: usize) -> DnsCacheConfig {
        DnsCacheConfig {
            enabled: true,
            hard_cap,
            default_min_ttl_secs: None,
            min_ttl_override_secs: None,
            max_ttl_override_secs: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_clamped_remaining_ttl() {
        let cache = DnsCache::new(config_with_cap(1000));
        cache
            .put("Example.COM.", RecordType::A, vec![1, 2, 3], 300)
            .await;

        let (response, ttl) = cache.get("example.com.", RecordType::A).await.unwrap();
        assert_eq!(response, vec![1, 2, 3]);
        assert!(ttl <= 300);
    }

    #[tokio::test]
    async fn miss_on_different_qtype() {
        let cache = DnsCache::new(config_with_cap(1000));
        cache
            .put("example.com.", RecordType::A, vec![1], 300)
            .await;

        assert!(cache.get("example.com.", RecordType::AAAA).await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_is_not_cached() {
        let cache = DnsCache::new(config_with_cap(1000));
        cache.put("example.com.", RecordType::A, vec![1], 0).await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn hard_cap_triggers_fractional_eviction() {
        let cache = DnsCache::new(config_with_cap(4));
        for i in 0..5 {
            let name = format!("host{}.example.com.", i);
            cache.put(&name, RecordType::A, vec![i as u8], 300).await;
        }
        assert!(cache.len().await < 5);
    }

    #[test]
    fn clamp_ttl_applies_default_min_then_bounds() {
        let cache = DnsCache::new(DnsCacheConfig {
            enabled: true,
            hard_cap: 1000,
            default_min_ttl_secs: Some(30),
            min_ttl_override_secs: Some(60),
            max_ttl_override_secs: Some(120),
        });

        assert_eq!(cache.clamp_ttl(0), 60);
        assert_eq!(cache.clamp_ttl(10), 60);
        assert_eq!(cache.clamp_ttl(90), 90);
        assert_eq!(cache.clamp_ttl(300), 120);
    }
}
