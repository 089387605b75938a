//! Gateway metrics and their Prometheus text exposition, served at
//! `/__portcullis/metrics`.
//!
//! Counter names are registered without the `_total` suffix; the text
//! encoder appends it.

use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Content-Type of [`MetricsRegistry::render`] output.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Duration histogram buckets (in seconds).
/// Covers 1ms to 30s, past the integration deadline ceiling.
const DURATION_BUCKETS: [f64; 13] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    /// Route pattern, or `unmatched`.
    pub route: String,
    pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthLabels {
    pub authorizer: String,
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ThrottleLabels {
    /// `rate` or `quota`.
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub route: String,
    /// `hit` or `miss`.
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IntegrationLabels {
    pub route: String,
    pub kind: String,
}

/// Metrics registry holding all gateway metrics.
pub struct MetricsRegistry {
    /// The prometheus-client registry for encoding.
    pub registry: Registry,

    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<RequestLabels, Histogram>,
    pub validation_failures_total: Family<RouteLabels, Counter>,
    pub auth_denials_total: Family<AuthLabels, Counter>,
    pub throttle_rejections_total: Family<ThrottleLabels, Counter>,
    pub cache_lookups_total: Family<CacheLabels, Counter>,
    pub integration_errors_total: Family<IntegrationLabels, Counter>,
    pub active_stage_version: Gauge,
    pub active_connections: Gauge,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "portcullis_requests",
            "Total number of HTTP requests processed",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().cloned())
            });
        registry.register(
            "portcullis_request_duration_seconds",
            "HTTP request duration in seconds",
            request_duration_seconds.clone(),
        );

        let validation_failures_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "portcullis_validation_failures",
            "Requests rejected by request validation",
            validation_failures_total.clone(),
        );

        let auth_denials_total = Family::<AuthLabels, Counter>::default();
        registry.register(
            "portcullis_auth_denials",
            "Requests denied by an authorizer",
            auth_denials_total.clone(),
        );

        let throttle_rejections_total = Family::<ThrottleLabels, Counter>::default();
        registry.register(
            "portcullis_throttle_rejections",
            "Requests rejected by rate or quota limits",
            throttle_rejections_total.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "portcullis_cache_lookups",
            "Response cache lookups by result",
            cache_lookups_total.clone(),
        );

        let integration_errors_total = Family::<IntegrationLabels, Counter>::default();
        registry.register(
            "portcullis_integration_errors",
            "Backend invocation failures by kind",
            integration_errors_total.clone(),
        );

        let active_stage_version = Gauge::default();
        registry.register(
            "portcullis_active_stage_version",
            "Version of the stage currently serving traffic",
            active_stage_version.clone(),
        );

        let active_connections = Gauge::default();
        registry.register(
            "portcullis_active_connections",
            "Number of currently open client connections",
            active_connections.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            validation_failures_total,
            auth_denials_total,
            throttle_rejections_total,
            cache_lookups_total,
            integration_errors_total,
            active_stage_version,
            active_connections,
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, method: &str, route: &str, status: u16, duration_secs: f64) {
        let labels = RequestLabels {
            method: method.to_string(),
            route: route.to_string(),
            status,
        };

        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_validation_failure(&self, route: &str) {
        self.validation_failures_total
            .get_or_create(&RouteLabels {
                route: route.to_string(),
            })
            .inc();
    }

    pub fn record_auth_denial(&self, authorizer: &str, reason: &str) {
        self.auth_denials_total
            .get_or_create(&AuthLabels {
                authorizer: authorizer.to_string(),
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_throttle_rejection(&self, reason: &str) {
        self.throttle_rejections_total
            .get_or_create(&ThrottleLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_cache_lookup(&self, route: &str, hit: bool) {
        self.cache_lookups_total
            .get_or_create(&CacheLabels {
                route: route.to_string(),
                result: if hit { "hit" } else { "miss" }.to_string(),
            })
            .inc();
    }

    pub fn record_integration_error(&self, route: &str, kind: &str) {
        self.integration_errors_total
            .get_or_create(&IntegrationLabels {
                route: route.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn set_active_stage(&self, version: u64) {
        self.active_stage_version
            .set(i64::try_from(version).unwrap_or(i64::MAX));
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Encode every registered metric in Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry).expect("encoding into a String cannot fail");
        buffer
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
