//! Response cache with per-route TTL.
//!
//! Entries are keyed by a request fingerprint and remember the route that
//! produced them, so a redeploy can drop everything a route cached. Expired
//! entries are evicted when looked up.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::request::{InboundRequest, OutboundResponse};

/// Per-route caching policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachePolicy {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Request headers that take part in the fingerprint.
    #[serde(default)]
    pub key_headers: Vec<String>,
    /// Query parameters that take part in the fingerprint; all when unset.
    #[serde(default)]
    pub key_query: Option<Vec<String>>,
}

fn default_ttl_secs() -> u64 {
    300
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Compute the cache fingerprint of a request for a route.
///
/// Covers the route identity, the normalized path, the sorted query pairs
/// and the policy's key headers.
pub fn fingerprint(route_id: &str, request: &InboundRequest, policy: &CachePolicy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(route_id.as_bytes());
    hasher.update([0]);
    // HEAD answers carry no body and must never satisfy a GET.
    hasher.update(request.method.as_bytes());
    hasher.update([0]);
    hasher.update(portcullis_router::normalize_path(&request.path).as_bytes());
    hasher.update([0]);

    let mut query: Vec<(&str, &str)> = request
        .query
        .iter()
        .filter(|(k, _)| match &policy.key_query {
            Some(keys) => keys.iter().any(|key| key == k),
            None => true,
        })
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    query.sort_unstable();
    for (k, v) in query {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update([0]);
    }

    hasher.update([1]);
    let mut headers: Vec<String> = policy
        .key_headers
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    headers.sort_unstable();
    headers.dedup();
    for name in headers {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        if let Some(value) = request.header(&name) {
            hasher.update(value.as_bytes());
        }
        hasher.update([0]);
    }

    hex::encode(hasher.finalize())
}

struct CacheEntry {
    route_id: String,
    status: u16,
    headers: BTreeMap<String, String>,
    body: Bytes,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Shared response cache.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: Option<usize>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ResponseCache {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Look up a fresh entry. An expired entry is removed and reported as a miss.
    pub fn lookup(&self, fingerprint: &str) -> Option<OutboundResponse> {
        self.lookup_at(fingerprint, Instant::now())
    }

    pub(crate) fn lookup_at(&self, fingerprint: &str, now: Instant) -> Option<OutboundResponse> {
        {
            let entry = self.entries.get(fingerprint)?;
            if !entry.is_expired(now) {
                return Some(OutboundResponse {
                    status: entry.status,
                    headers: entry.headers.clone(),
                    body: entry.body.clone(),
                });
            }
        }
        self.entries.remove_if(fingerprint, |_, entry| entry.is_expired(now));
        None
    }

    /// Store a successful response. Returns whether it was stored.
    ///
    /// Non-2xx responses are never stored. When the cache is at capacity,
    /// expired entries are swept first and the store is skipped if that
    /// frees nothing.
    pub fn store(&self, fingerprint: &str, route_id: &str, response: &OutboundResponse, ttl: Duration) -> bool {
        if !response.is_success() || ttl.is_zero() {
            return false;
        }

        let now = Instant::now();
        if let Some(max) = self.max_entries {
            if !self.entries.contains_key(fingerprint) && self.entries.len() >= max {
                self.entries.retain(|_, entry| !entry.is_expired(now));
                if self.entries.len() >= max {
                    return false;
                }
            }
        }

        self.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                route_id: route_id.to_string(),
                status: response.status,
                headers: response.headers.clone(),
                body: response.body.clone(),
                stored_at: now,
                ttl,
            },
        );
        true
    }

    /// Drop every entry produced by one of `route_ids`. Returns how many went.
    pub fn invalidate_routes(&self, route_ids: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !route_ids.contains(&entry.route_id));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
