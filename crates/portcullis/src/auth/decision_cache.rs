//! Time-bound cache of delegated authorization decisions.
//!
//! One slot per (credential hash, resource). A live decision is never
//! overwritten: a decision reached concurrently for the same key yields to
//! the stored one, so an Allow and a Deny for one key never coexist. A slot
//! takes a new decision only once the old one has expired. Expired slots
//! are evicted on lookup and swept at most once per TTL.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::AuthDecision;

pub struct DecisionCache {
    entries: DashMap<String, AuthDecision>,
    ttl: Duration,
    last_cleanup: Mutex<Instant>,
}

/// Cache key for a credential and resource. The raw credential is never kept.
pub fn cache_key(credential: &str, resource: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    format!("{}:{}", hex::encode(digest), resource)
}

impl DecisionCache {
    /// A zero TTL disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, key: &str) -> Option<AuthDecision> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<AuthDecision> {
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at.is_some_and(|at| now < at) {
                return Some(entry.clone());
            }
        }
        self.entries
            .remove_if(key, |_, d| d.expires_at.is_none_or(|at| now >= at));
        None
    }

    /// Store a decision unless a live one already holds the slot, and
    /// return whichever decision is now cached, stamped with its expiry.
    pub fn insert(&self, key: String, decision: AuthDecision) -> AuthDecision {
        self.insert_at(key, decision, Instant::now())
    }

    pub(crate) fn insert_at(&self, key: String, mut decision: AuthDecision, now: Instant) -> AuthDecision {
        if !self.is_enabled() {
            return decision;
        }
        self.maybe_cleanup(now);
        decision.expires_at = Some(now + self.ttl);
        match self.entries.entry(key) {
            Entry::Occupied(entry) if entry.get().expires_at.is_some_and(|at| now < at) => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                entry.insert(decision.clone());
                decision
            }
            Entry::Vacant(entry) => {
                entry.insert(decision.clone());
                decision
            }
        }
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < self.ttl {
                return;
            }
            *last = now;
        }
        self.entries
            .retain(|_, d| d.expires_at.is_some_and(|at| now < at));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Effect;

    #[test]
    fn hit_within_ttl_and_eviction_after() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        let key = cache_key("token", "prod/GET/pets");
        let t0 = Instant::now();

        cache.insert_at(key.clone(), AuthDecision::allow("user-1"), t0);
        let hit = cache.get_at(&key, t0 + Duration::from_secs(299)).unwrap();
        assert_eq!(hit.principal_id, "user-1");
        assert_eq!(hit.expires_at, Some(t0 + Duration::from_secs(300)));

        assert!(cache.get_at(&key, t0 + Duration::from_secs(300)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn live_decision_is_kept_until_it_expires() {
        let cache = DecisionCache::new(Duration::from_secs(60));
        let key = cache_key("token", "prod/GET/pets");
        let t0 = Instant::now();

        cache.insert_at(key.clone(), AuthDecision::allow("u"), t0);
        let racing = cache.insert_at(key.clone(), AuthDecision::deny("u", "revoked"), t0 + Duration::from_secs(1));
        assert_eq!(racing.effect, Effect::Allow);
        assert_eq!(racing.expires_at, Some(t0 + Duration::from_secs(60)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at(&key, t0 + Duration::from_secs(59)).unwrap().effect, Effect::Allow);

        let later = t0 + Duration::from_secs(61);
        let fresh = cache.insert_at(key.clone(), AuthDecision::deny("u", "revoked"), later);
        assert_eq!(fresh.effect, Effect::Deny);
        assert_eq!(cache.get_at(&key, later).unwrap().effect, Effect::Deny);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_separate_resources_and_hide_credentials() {
        let a = cache_key("secret-token", "prod/GET/pets");
        let b = cache_key("secret-token", "prod/POST/pets");
        assert_ne!(a, b);
        assert!(!a.contains("secret-token"));
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = DecisionCache::new(Duration::ZERO);
        let decision = cache.insert("k".into(), AuthDecision::allow("u"));
        assert!(decision.expires_at.is_none());
        assert!(cache.get("k").is_none());
    }
}
