//! The request pipeline.
//!
//! limits → reserved endpoints → stage → route match → throttle →
//! authorize → validate → cache lookup → invoke → cache store.
//!
//! Each step either hands a value to the next or ends the request with a
//! [`GatewayError`]; nothing reaches a backend before every gate passed.

mod admin;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use portcullis_telemetry::{
    log_auth_denied, log_authorizer_error, log_integration_error, log_request_completed, log_stage_published,
    log_stage_retired, log_throttled, log_validation_failure, MetricsRegistry,
};
use portcullis_validator::RequestLimits;

use crate::auth::{AuthContext, AuthError, Authorizer};
use crate::cache::{fingerprint, ResponseCache};
use crate::config::{Catalog, ConfigError, GatewayConfig, RouteConfig};
use crate::error::GatewayError;
use crate::integration::{IntegrationInvoker, InvocationContext};
use crate::request::{InboundRequest, OutboundResponse};
use crate::route::Route;
use crate::stage::{Stage, StageMatch, StageRegistry};
use crate::throttle::{Admission, Throttle, ThrottleLimits};

/// Prefix of the gateway's own endpoints.
pub const RESERVED_PREFIX: &str = "/__portcullis/";
/// Request header selecting a retained stage by version.
pub const STAGE_HEADER: &str = "x-portcullis-stage";

/// Route label used in metrics and logs when no route matched.
const UNMATCHED: &str = "unmatched";

/// Settings the pipeline reads on every request.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub stage: String,
    pub dev_mode: bool,
    pub admin_token: Option<String>,
    pub limits: RequestLimits,
    pub throttle: ThrottleLimits,
    pub usage_plans: BTreeMap<String, ThrottleLimits>,
    pub cache_max_entries: Option<usize>,
}

impl GatewaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            stage: config.stage.clone(),
            dev_mode: config.dev_mode,
            admin_token: config.admin_token.clone(),
            limits: config.limits.clone(),
            throttle: config.throttle.clone(),
            usage_plans: config.usage_plans.clone(),
            cache_max_entries: config.cache.max_entries,
        }
    }

    fn limits_for(&self, plan: Option<&str>) -> &ThrottleLimits {
        plan.and_then(|name| self.usage_plans.get(name))
            .unwrap_or(&self.throttle)
    }
}

pub struct Gateway {
    settings: GatewaySettings,
    catalog: Catalog,
    stages: StageRegistry,
    throttle: Throttle,
    cache: ResponseCache,
    invoker: IntegrationInvoker,
    metrics: Arc<MetricsRegistry>,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, catalog: Catalog, http: reqwest::Client, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            stages: StageRegistry::new(settings.stage.clone()),
            cache: ResponseCache::new(settings.cache_max_entries),
            throttle: Throttle::new(),
            invoker: IntegrationInvoker::new(http),
            settings,
            catalog,
            metrics,
        }
    }

    /// Build a gateway from configuration and publish its routes as stage 1.
    pub fn from_config(config: &GatewayConfig, metrics: Arc<MetricsRegistry>) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;
        let catalog = Catalog::build(config, &http)?;
        let routes = catalog.build_routes(&config.routes)?;

        let gateway = Self::new(GatewaySettings::from_config(config), catalog, http, metrics);
        if !routes.is_empty() {
            gateway.stages.publish(routes)?;
            if let Some(stage) = gateway.stages.active() {
                gateway.metrics.set_active_stage(stage.version);
                log_stage_published!(version = stage.version, routes = stage.routes().len(), "initial stage published");
            }
        }
        Ok(gateway)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn stages(&self) -> &StageRegistry {
        &self.stages
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Publish a new stage and drop cached responses of every route in
    /// the outgoing and incoming stages.
    pub fn publish(&self, routes: Vec<Route>) -> Result<Arc<Stage>, GatewayError> {
        let publication = self.stages.publish(routes).map_err(|e| {
            tracing::warn!(error = %e, "stage publish rejected");
            GatewayError::from(e)
        })?;

        let mut route_ids = publication.stage.route_ids();
        if let Some(previous) = &publication.previous {
            route_ids.extend(previous.route_ids());
        }
        let invalidated = self.cache.invalidate_routes(&route_ids);

        let stage = publication.stage;
        self.metrics.set_active_stage(stage.version);
        log_stage_published!(
            version = stage.version,
            routes = stage.routes().len(),
            previous = ?publication.previous.as_ref().map(|s| s.version),
            cache_invalidated = invalidated,
            "stage published"
        );
        Ok(stage)
    }

    /// Build routes from their configuration form and publish them.
    pub fn publish_definitions(&self, routes: &[RouteConfig]) -> Result<Arc<Stage>, GatewayError> {
        let routes = self
            .catalog
            .build_routes(routes)
            .map_err(|e| GatewayError::InvalidStage(e.to_string()))?;
        self.publish(routes)
    }

    pub fn retire(&self, version: u64) -> Result<(), GatewayError> {
        let stage = self.stages.retire(version)?;
        log_stage_retired!(version = stage.version, "stage retired");
        Ok(())
    }

    /// Serve one request. Every failure becomes a problem response.
    pub async fn handle(&self, request: InboundRequest) -> OutboundResponse {
        let started = Instant::now();
        let mut route_label = String::from(UNMATCHED);

        let response = match self.process(&request, &mut route_label).await {
            Ok(response) => response,
            Err(error) => error.into_response(self.settings.dev_mode),
        };
        let response = response.with_header("x-request-id", request.request_id.as_str());

        let elapsed = started.elapsed();
        self.metrics
            .record_request(&request.method, &route_label, response.status, elapsed.as_secs_f64());
        log_request_completed!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            route = %route_label,
            status = response.status,
            duration_ms = elapsed.as_millis() as u64,
            "request completed"
        );
        response
    }

    async fn process(&self, request: &InboundRequest, route_label: &mut String) -> Result<OutboundResponse, GatewayError> {
        let limits = &self.settings.limits;
        limits
            .validate_uri(&request.uri())
            .map_err(|v| GatewayError::LimitsExceeded(vec![v]))?;

        if request.path.starts_with(RESERVED_PREFIX) {
            *route_label = RESERVED_PREFIX.trim_end_matches('/').to_string();
            return admin::handle(self, request).await;
        }

        limits
            .validate_all(&request.uri(), &request.headers, request.body.len())
            .map_err(GatewayError::LimitsExceeded)?;

        let stage = self.select_stage(request)?;
        let (route, params) = match stage.match_route(&request.method, &request.path) {
            StageMatch::Found { route, params } => (Arc::clone(route), params),
            StageMatch::MethodNotAllowed(allowed) => return Err(GatewayError::MethodNotAllowed { allowed }),
            StageMatch::NotFound => return Err(GatewayError::RouteNotFound),
        };
        let route_id = route.id();
        *route_label = route_id.clone();

        let remaining = self.admit(request, &route)?;

        let auth = match &route.authorizer {
            Some(authorizer) => {
                self.authorize(request, authorizer, &route.resource_identifier(&stage.label))
                    .await?
            }
            None => AuthContext::default(),
        };

        if let Some(validator) = &route.validator {
            if let Err(errors) = validator.validate(&request.query, &request.headers, &request.body) {
                self.metrics.record_validation_failure(&route_id);
                log_validation_failure!(
                    request_id = %request.request_id,
                    route = %route_id,
                    errors = errors.len(),
                    "request failed validation"
                );
                return Err(GatewayError::ValidationFailed(errors));
            }
        }

        // Fingerprints are per stage version so a targeted older stage never
        // serves entries of the active one.
        let cache_slot = route
            .cache
            .as_ref()
            .filter(|_| matches!(request.method.as_str(), "GET" | "HEAD"))
            .map(|policy| {
                let scope = format!("{}@{}", route_id, stage.version);
                (fingerprint(&scope, request, policy), policy.ttl())
            });

        if let Some((fp, _)) = &cache_slot {
            let hit = self.cache.lookup(fp);
            self.metrics.record_cache_lookup(&route_id, hit.is_some());
            if let Some(cached) = hit {
                return Ok(with_rate_limit(cached.with_header("x-cache", "HIT"), remaining));
            }
        }

        let ctx = InvocationContext {
            request,
            stage: &stage.label,
            resource: &route.path,
            path_params: &params,
            auth: &auth,
            credential_header: route.authorizer.as_ref().map(|a| a.credential_header()),
        };
        let response = self
            .invoker
            .invoke(&route.integration, &ctx, route.timeout, route.retry.as_ref())
            .await
            .map_err(|e| {
                self.metrics.record_integration_error(&route_id, e.kind());
                log_integration_error!(
                    request_id = %request.request_id,
                    route = %route_id,
                    kind = e.kind(),
                    error = %e,
                    "integration failed"
                );
                GatewayError::from(e)
            })?;

        let response = match cache_slot {
            Some((fp, ttl)) => {
                self.cache.store(&fp, &route_id, &response, ttl);
                response.with_header("x-cache", "MISS")
            }
            None => response,
        };
        Ok(with_rate_limit(response, remaining))
    }

    /// The active stage, or a retained one named by the stage header.
    fn select_stage(&self, request: &InboundRequest) -> Result<Arc<Stage>, GatewayError> {
        match request.header(STAGE_HEADER) {
            Some(raw) => {
                let version: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| GatewayError::BadRequest(format!("invalid {} header", STAGE_HEADER)))?;
                self.stages
                    .get(version)
                    .ok_or(GatewayError::StageNotFound(version))
            }
            None => self.stages.active().ok_or(GatewayError::NoActiveStage),
        }
    }

    /// Throttle by API key identity when the route uses a key authorizer
    /// and the key is known, otherwise by client address.
    fn admit(&self, request: &InboundRequest, route: &Route) -> Result<u32, GatewayError> {
        let identity = route
            .authorizer
            .as_ref()
            .and_then(|authorizer| authorizer.key_identity(request));

        let (key, limits) = match identity {
            Some(identity) => (
                format!("key:{}", identity.id),
                self.settings.limits_for(identity.usage_plan.as_deref()),
            ),
            None => (
                format!("client:{}", request.client_ip().as_deref().unwrap_or("unknown")),
                &self.settings.throttle,
            ),
        };

        match self.throttle.admit(&key, limits) {
            Admission::Admitted { remaining } => Ok(remaining),
            Admission::Rejected { retry_after, reason } => {
                self.metrics.record_throttle_rejection(reason.as_str());
                log_throttled!(
                    request_id = %request.request_id,
                    key = %key,
                    reason = reason.as_str(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request throttled"
                );
                Err(GatewayError::ThrottleRejected { retry_after, reason })
            }
        }
    }

    async fn authorize(
        &self,
        request: &InboundRequest,
        authorizer: &Authorizer,
        resource: &str,
    ) -> Result<AuthContext, GatewayError> {
        match authorizer.authorize(request, resource).await {
            Ok(decision) if decision.is_allowed() => Ok(AuthContext::from(&decision)),
            Ok(decision) => {
                let reason = decision.reason.unwrap_or_else(|| "denied".into());
                self.metrics.record_auth_denial(&authorizer.name, "deny");
                log_auth_denied!(
                    request_id = %request.request_id,
                    authorizer = %authorizer.name,
                    principal = %decision.principal_id,
                    resource,
                    reason = %reason,
                    "request denied"
                );
                Err(GatewayError::Forbidden { reason })
            }
            Err(AuthError::MissingCredential(source)) => {
                self.metrics.record_auth_denial(&authorizer.name, "missing_credential");
                log_auth_denied!(
                    request_id = %request.request_id,
                    authorizer = %authorizer.name,
                    resource,
                    source = %source,
                    "credential missing"
                );
                Err(GatewayError::Unauthorized(source))
            }
            Err(error) => {
                self.metrics.record_auth_denial(&authorizer.name, "contract_violation");
                log_authorizer_error!(
                    request_id = %request.request_id,
                    authorizer = %authorizer.name,
                    error = %error,
                    "authorizer returned a malformed decision"
                );
                Err(error.into())
            }
        }
    }
}

fn with_rate_limit(response: OutboundResponse, remaining: u32) -> OutboundResponse {
    response.with_header("x-ratelimit-remaining", remaining.to_string())
}
