//! Token-bucket throttling with an optional quota window.
//!
//! Buckets are keyed per API key identity or per client address. Each key
//! owns its own lock, so unrelated keys never contend. Refill and quota
//! resets are computed from timestamps at admission time; nothing runs in
//! the background.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;

/// Longest wait ever advertised, the longest quota period.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30 * 86_400);

/// Rate and quota limits applied to one throttle key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleLimits {
    /// Bucket capacity: the largest burst admitted at once.
    pub burst: u32,
    /// Tokens added per second.
    pub rate_per_second: f64,
    #[serde(default)]
    pub quota: Option<Quota>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Quota {
    pub limit: u64,
    pub period: QuotaPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Day,
    Week,
    /// Thirty days.
    Month,
}

impl QuotaPeriod {
    pub fn duration(self) -> Duration {
        let days = match self {
            QuotaPeriod::Day => 1,
            QuotaPeriod::Week => 7,
            QuotaPeriod::Month => 30,
        };
        Duration::from_secs(days * 86_400)
    }
}

impl ThrottleLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.burst == 0 {
            return Err("burst must be at least 1".into());
        }
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err("rate_per_second must be a positive number".into());
        }
        if matches!(&self.quota, Some(q) if q.limit == 0) {
            return Err("quota limit must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    Rate,
    Quota,
}

impl ThrottleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ThrottleReason::Rate => "rate",
            ThrottleReason::Quota => "quota",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Admitted; `remaining` whole tokens are left in the bucket.
    Admitted { remaining: u32 },
    Rejected {
        retry_after: Duration,
        reason: ThrottleReason,
    },
}

/// Mutable per-key state. Only touched while holding its own lock.
#[derive(Debug)]
pub struct ThrottleBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    quota_used: u64,
    quota_reset_at: Option<Instant>,
}

impl ThrottleBucket {
    fn new(limits: &ThrottleLimits, now: Instant) -> Self {
        let capacity = f64::from(limits.burst);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: limits.rate_per_second,
            last_refill: now,
            quota_used: 0,
            quota_reset_at: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn admit(&mut self, limits: &ThrottleLimits, now: Instant) -> Admission {
        // Limits can change when a key moves to another usage plan.
        self.capacity = f64::from(limits.burst);
        self.refill_rate = limits.rate_per_second;
        self.refill(now);

        if let Some(quota) = &limits.quota {
            let reset_at = match self.quota_reset_at {
                Some(at) if now < at => at,
                _ => {
                    self.quota_used = 0;
                    let at = now + quota.period.duration();
                    self.quota_reset_at = Some(at);
                    at
                }
            };
            if self.quota_used >= quota.limit {
                return Admission::Rejected {
                    retry_after: reset_at.saturating_duration_since(now),
                    reason: ThrottleReason::Quota,
                };
            }
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.quota_used += 1;
            Admission::Admitted {
                remaining: self.tokens.floor() as u32,
            }
        } else {
            let wait = Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_rate).unwrap_or(MAX_RETRY_AFTER);
            Admission::Rejected {
                retry_after: wait.min(MAX_RETRY_AFTER),
                reason: ThrottleReason::Rate,
            }
        }
    }

    /// Full bucket and no live quota usage: indistinguishable from a new one.
    fn is_idle(&mut self, now: Instant) -> bool {
        self.refill(now);
        let quota_idle = match self.quota_reset_at {
            Some(at) => self.quota_used == 0 || now >= at,
            None => true,
        };
        self.tokens >= self.capacity && quota_idle
    }
}

/// Per-key throttle.
pub struct Throttle {
    buckets: DashMap<String, Arc<Mutex<ThrottleBucket>>>,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            cleanup_interval: Duration::from_secs(60),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Try to admit one request for `key`.
    pub fn admit(&self, key: &str, limits: &ThrottleLimits) -> Admission {
        self.admit_at(key, limits, Instant::now())
    }

    pub(crate) fn admit_at(&self, key: &str, limits: &ThrottleLimits, now: Instant) -> Admission {
        self.maybe_cleanup(now);

        // Clone the bucket handle so the shard lock is released before the
        // per-key lock is taken.
        let bucket = match self.buckets.get(key) {
            Some(bucket) => Arc::clone(bucket.value()),
            None => Arc::clone(
                self.buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(ThrottleBucket::new(limits, now))))
                    .value(),
            ),
        };

        let mut bucket = bucket.lock();
        bucket.admit(limits, now)
    }

    /// Drop idle buckets, at most once per cleanup interval.
    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < self.cleanup_interval {
                return;
            }
            *last = now;
        }

        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Some(mut bucket) => !bucket.is_idle(now),
            // In use right now, so not idle.
            None => true,
        });
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(burst: u32, rate: f64) -> ThrottleLimits {
        ThrottleLimits {
            burst,
            rate_per_second: rate,
            quota: None,
        }
    }

    fn retry_after(admission: Admission) -> Duration {
        match admission {
            Admission::Rejected { retry_after, .. } => retry_after,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn burst_then_refill() {
        let throttle = Throttle::new();
        let limits = limits(2, 1.0);
        let t0 = Instant::now();

        assert_eq!(throttle.admit_at("k", &limits, t0), Admission::Admitted { remaining: 1 });
        assert_eq!(throttle.admit_at("k", &limits, t0), Admission::Admitted { remaining: 0 });

        let wait = retry_after(throttle.admit_at("k", &limits, t0));
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-6, "retry after {:?}", wait);

        assert!(matches!(
            throttle.admit_at("k", &limits, t0 + Duration::from_secs(1)),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            throttle.admit_at("k", &limits, t0 + Duration::from_secs(1)),
            Admission::Rejected { reason: ThrottleReason::Rate, .. }
        ));
    }

    #[test]
    fn partial_refill_shortens_retry_after() {
        let throttle = Throttle::new();
        let limits = limits(1, 2.0);
        let t0 = Instant::now();

        throttle.admit_at("k", &limits, t0);
        let wait = retry_after(throttle.admit_at("k", &limits, t0 + Duration::from_millis(250)));
        // Half a token refilled at 2/s; the other half takes 250ms.
        assert!((wait.as_secs_f64() - 0.25).abs() < 1e-6, "retry after {:?}", wait);
    }

    #[test]
    fn vanishing_rate_caps_retry_after() {
        let throttle = Throttle::new();
        let limits = limits(1, 1e-20);
        assert!(limits.validate().is_ok());
        let t0 = Instant::now();

        throttle.admit_at("k", &limits, t0);
        assert_eq!(retry_after(throttle.admit_at("k", &limits, t0)), MAX_RETRY_AFTER);
    }

    #[test]
    fn keys_are_independent() {
        let throttle = Throttle::new();
        let limits = limits(1, 1.0);
        let t0 = Instant::now();

        assert!(matches!(throttle.admit_at("a", &limits, t0), Admission::Admitted { .. }));
        assert!(matches!(throttle.admit_at("b", &limits, t0), Admission::Admitted { .. }));
        assert!(matches!(throttle.admit_at("a", &limits, t0), Admission::Rejected { .. }));
    }

    #[test]
    fn quota_rejects_until_window_resets() {
        let throttle = Throttle::new();
        let limits = ThrottleLimits {
            burst: 10,
            rate_per_second: 10.0,
            quota: Some(Quota {
                limit: 2,
                period: QuotaPeriod::Day,
            }),
        };
        let t0 = Instant::now();

        throttle.admit_at("k", &limits, t0);
        throttle.admit_at("k", &limits, t0);
        let rejected = throttle.admit_at("k", &limits, t0 + Duration::from_secs(60));
        match rejected {
            Admission::Rejected { retry_after, reason } => {
                assert_eq!(reason, ThrottleReason::Quota);
                assert_eq!(retry_after, Duration::from_secs(86_400 - 60));
            }
            other => panic!("expected quota rejection, got {:?}", other),
        }

        let next_day = t0 + Duration::from_secs(86_400);
        assert!(matches!(throttle.admit_at("k", &limits, next_day), Admission::Admitted { .. }));
    }

    #[test]
    fn quota_rejection_does_not_consume_tokens() {
        let throttle = Throttle::new();
        let limits = ThrottleLimits {
            burst: 1,
            rate_per_second: 1.0,
            quota: Some(Quota {
                limit: 1,
                period: QuotaPeriod::Day,
            }),
        };
        let t0 = Instant::now();
        throttle.admit_at("k", &limits, t0);
        // Bucket is empty, but the quota is the binding limit.
        assert!(matches!(
            throttle.admit_at("k", &limits, t0),
            Admission::Rejected { reason: ThrottleReason::Quota, .. }
        ));
    }

    #[test]
    fn concurrent_admissions_never_over_admit() {
        let throttle = Arc::new(Throttle::new());
        let limits = limits(50, 0.001);
        let t0 = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let limits = limits.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| matches!(throttle.admit_at("shared", &limits, t0), Admission::Admitted { .. }))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn idle_buckets_are_pruned() {
        let throttle = Throttle::new();
        let limits = limits(1, 1.0);
        let t0 = Instant::now();

        throttle.admit_at("idle", &limits, t0);
        assert_eq!(throttle.len(), 1);

        // Past the cleanup interval the bucket has long refilled.
        throttle.admit_at("other", &limits, t0 + Duration::from_secs(120));
        assert_eq!(throttle.len(), 1);
    }

    #[test]
    fn limits_validation() {
        assert!(limits(0, 1.0).validate().is_err());
        assert!(limits(1, 0.0).validate().is_err());
        assert!(limits(1, f64::NAN).validate().is_err());
        assert!(limits(5, 0.5).validate().is_ok());
    }
}
