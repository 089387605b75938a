//! Gateway error taxonomy and its RFC 9457 rendering.

use std::time::Duration;

use portcullis_router::RouteConflict;
use portcullis_validator::{FieldError, LimitViolation, ProblemDetails};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::integration::{BackendError, IntegrationError};
use crate::request::OutboundResponse;
use crate::stage::StageError;
use crate::throttle::ThrottleReason;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches the request path")]
    RouteNotFound,

    #[error("method not allowed; allowed: {}", .allowed.join(", "))]
    MethodNotAllowed { allowed: Vec<String> },

    #[error("request exceeds gateway limits")]
    LimitsExceeded(Vec<LimitViolation>),

    #[error("request validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<FieldError>),

    #[error("missing credential in '{0}'")]
    Unauthorized(String),

    /// A legitimate Deny. The reason is logged, never returned.
    #[error("access denied: {reason}")]
    Forbidden { reason: String },

    #[error("authorizer contract violation: {0}")]
    AuthorizerContractViolation(String),

    #[error("throttled ({}), retry after {}ms", .reason.as_str(), .retry_after.as_millis())]
    ThrottleRejected {
        retry_after: Duration,
        reason: ThrottleReason,
    },

    #[error("integration timed out after {}ms", .0.as_millis())]
    IntegrationTimeout(Duration),

    #[error("malformed integration response: {0}")]
    MalformedIntegrationResponse(String),

    #[error("integration transform failed: {0}")]
    IntegrationTransformFailed(String),

    #[error("integration failed: {0}")]
    IntegrationFailed(BackendError),

    #[error("no stage has been published")]
    NoActiveStage,

    #[error("stage {0} not found")]
    StageNotFound(u64),

    #[error("stage {0} is active and cannot be retired")]
    StageActive(u64),

    #[error("conflicting route: {0}")]
    ConflictingRoute(RouteConflict),

    #[error("invalid stage definition: {0}")]
    InvalidStage(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::RouteNotFound | GatewayError::StageNotFound(_) => 404,
            GatewayError::MethodNotAllowed { .. } => 405,
            GatewayError::LimitsExceeded(_)
            | GatewayError::ValidationFailed(_)
            | GatewayError::InvalidStage(_)
            | GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::Forbidden { .. } => 403,
            GatewayError::StageActive(_) | GatewayError::ConflictingRoute(_) => 409,
            GatewayError::IntegrationFailed(BackendError::TimedOut(_)) => 504,
            GatewayError::ThrottleRejected { .. } => 429,
            GatewayError::AuthorizerContractViolation(_) | GatewayError::IntegrationTransformFailed(_) => 500,
            GatewayError::MalformedIntegrationResponse(_) | GatewayError::IntegrationFailed(_) => 502,
            GatewayError::NoActiveStage => 503,
            GatewayError::IntegrationTimeout(_) => 504,
        }
    }

    /// Problem type slug, `urn:portcullis:error:<slug>`.
    pub fn slug(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound => "route-not-found",
            GatewayError::MethodNotAllowed { .. } => "method-not-allowed",
            GatewayError::LimitsExceeded(_) => "request-limits",
            GatewayError::ValidationFailed(_) => "validation-failed",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::AuthorizerContractViolation(_) => "authorizer-contract-violation",
            GatewayError::ThrottleRejected { .. } => "throttled",
            GatewayError::IntegrationTimeout(_) | GatewayError::IntegrationFailed(BackendError::TimedOut(_)) => {
                "integration-timeout"
            }
            GatewayError::MalformedIntegrationResponse(_) => "malformed-integration-response",
            GatewayError::IntegrationTransformFailed(_) => "integration-transform-failed",
            GatewayError::IntegrationFailed(_) => "integration-failed",
            GatewayError::NoActiveStage => "no-active-stage",
            GatewayError::StageNotFound(_) => "stage-not-found",
            GatewayError::StageActive(_) => "stage-active",
            GatewayError::ConflictingRoute(_) => "conflicting-route",
            GatewayError::InvalidStage(_) => "invalid-stage",
            GatewayError::BadRequest(_) => "bad-request",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound => "Not Found",
            GatewayError::MethodNotAllowed { .. } => "Method Not Allowed",
            GatewayError::LimitsExceeded(_) => "Request exceeds gateway limits",
            GatewayError::ValidationFailed(_) => "Request validation failed",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::Forbidden { .. } => "Forbidden",
            GatewayError::AuthorizerContractViolation(_) => "Authorizer error",
            GatewayError::ThrottleRejected { .. } => "Too Many Requests",
            GatewayError::IntegrationTimeout(_) | GatewayError::IntegrationFailed(BackendError::TimedOut(_)) => {
                "Gateway Timeout"
            }
            GatewayError::MalformedIntegrationResponse(_) | GatewayError::IntegrationFailed(_) => "Bad Gateway",
            GatewayError::IntegrationTransformFailed(_) => "Internal Server Error",
            GatewayError::NoActiveStage => "Service Unavailable",
            GatewayError::StageNotFound(_) => "Stage Not Found",
            GatewayError::StageActive(_) => "Stage Is Active",
            GatewayError::ConflictingRoute(_) => "Conflicting Route",
            GatewayError::InvalidStage(_) => "Invalid Stage",
            GatewayError::BadRequest(_) => "Bad Request",
        }
    }

    /// Whether the detail is about gateway or backend internals and should
    /// only be shown in dev mode.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthorizerContractViolation(_)
                | GatewayError::IntegrationTimeout(_)
                | GatewayError::MalformedIntegrationResponse(_)
                | GatewayError::IntegrationTransformFailed(_)
                | GatewayError::IntegrationFailed(_)
        )
    }

    pub fn to_problem(&self, dev_mode: bool) -> ProblemDetails {
        match self {
            GatewayError::ValidationFailed(errors) => return ProblemDetails::validation_failed(errors),
            GatewayError::LimitsExceeded(violations) => return ProblemDetails::limits_exceeded(violations),
            _ => {}
        }

        let problem = ProblemDetails::new(self.status(), self.slug(), self.title());
        match self {
            GatewayError::Forbidden { .. } => problem,
            GatewayError::ThrottleRejected { retry_after, .. } => problem
                .with_detail("rate limit exceeded")
                .with_extension("retryAfterSeconds", json!(retry_after_secs(*retry_after))),
            GatewayError::MethodNotAllowed { allowed } => problem
                .with_detail(self.to_string())
                .with_extension("allowed", json!(allowed)),
            _ if self.is_internal() && !dev_mode => problem,
            _ => problem.with_detail(self.to_string()),
        }
    }

    pub fn into_response(self, dev_mode: bool) -> OutboundResponse {
        let response = OutboundResponse::problem(&self.to_problem(dev_mode));
        match self {
            GatewayError::ThrottleRejected { retry_after, .. } => {
                response.with_header("retry-after", retry_after_secs(retry_after).to_string())
            }
            GatewayError::MethodNotAllowed { allowed } => response.with_header("allow", allowed.join(", ")),
            _ => response,
        }
    }
}

/// Retry-After is whole seconds, rounded up, at least 1.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after
        .as_secs()
        .saturating_add(u64::from(retry_after.subsec_nanos() > 0));
    secs.max(1)
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingCredential(source) => GatewayError::Unauthorized(source),
            AuthError::ContractViolation(msg) => GatewayError::AuthorizerContractViolation(msg),
        }
    }
}

impl From<IntegrationError> for GatewayError {
    fn from(e: IntegrationError) -> Self {
        match e {
            IntegrationError::Timeout(after) => GatewayError::IntegrationTimeout(after),
            IntegrationError::MalformedResponse(msg) => GatewayError::MalformedIntegrationResponse(msg),
            IntegrationError::TransformFailed(msg) => GatewayError::IntegrationTransformFailed(msg),
            IntegrationError::InvalidPath(msg) => GatewayError::BadRequest(msg),
            IntegrationError::Backend(e) => GatewayError::IntegrationFailed(e),
        }
    }
}

impl From<StageError> for GatewayError {
    fn from(e: StageError) -> Self {
        match e {
            StageError::Conflict(conflict) => GatewayError::ConflictingRoute(conflict),
            StageError::NotFound(version) => GatewayError::StageNotFound(version),
            StageError::Active(version) => GatewayError::StageActive(version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn body(response: &OutboundResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn throttle_rejection_carries_retry_after() {
        let response = GatewayError::ThrottleRejected {
            retry_after: Duration::from_millis(1_200),
            reason: ThrottleReason::Rate,
        }
        .into_response(false);

        assert_eq!(response.status, 429);
        assert_eq!(response.header("retry-after"), Some("2"));
        assert_eq!(response.header("content-type"), Some("application/problem+json"));
        assert_eq!(body(&response)["type"], "urn:portcullis:error:throttled");
        assert_eq!(retry_after_secs(Duration::from_millis(10)), 1);
        assert_eq!(retry_after_secs(Duration::MAX), u64::MAX);
    }

    #[test]
    fn method_not_allowed_sets_allow_header() {
        let response = GatewayError::MethodNotAllowed {
            allowed: vec!["GET".into(), "POST".into()],
        }
        .into_response(false);
        assert_eq!(response.status, 405);
        assert_eq!(response.header("allow"), Some("GET, POST"));
    }

    #[test]
    fn integration_detail_is_hidden_outside_dev_mode() {
        let error = GatewayError::IntegrationFailed(BackendError::Function {
            message: "db password rejected".into(),
            error_type: None,
        });
        let hidden = error.to_problem(false);
        assert_eq!(hidden.status, 502);
        assert_eq!(hidden.title, "Bad Gateway");
        assert!(hidden.detail.is_none());

        let shown = error.to_problem(true);
        assert!(shown.detail.unwrap().contains("db password rejected"));
    }

    #[test]
    fn deny_reason_never_leaks() {
        let problem = GatewayError::Forbidden {
            reason: "key disabled".into(),
        }
        .to_problem(true);
        assert_eq!(problem.status, 403);
        assert!(problem.detail.is_none());
    }

    #[test]
    fn conversions_keep_the_taxonomy() {
        assert_eq!(GatewayError::from(AuthError::MissingCredential("x-api-key".into())).status(), 401);
        assert_eq!(GatewayError::from(AuthError::ContractViolation("bad".into())).status(), 500);
        assert_eq!(GatewayError::from(IntegrationError::Timeout(Duration::from_secs(1))).status(), 504);
        assert_eq!(GatewayError::from(IntegrationError::MalformedResponse("x".into())).status(), 502);
        assert_eq!(GatewayError::from(IntegrationError::TransformFailed("x".into())).status(), 500);
        assert_eq!(GatewayError::from(StageError::Active(3)).status(), 409);
        assert_eq!(GatewayError::from(IntegrationError::InvalidPath("dot".into())).status(), 400);

        let timed_out = GatewayError::from(IntegrationError::Backend(BackendError::TimedOut("slow".into())));
        assert_eq!(timed_out.status(), 504);
        assert_eq!(timed_out.slug(), "integration-timeout");
    }
}
