//! Integration invoker: calls a route's backend and shapes the response.
//!
//! Every invocation runs under a single deadline. When it passes, the
//! in-flight call is dropped and the caller gets `IntegrationError::Timeout`
//! with no partial result.

pub mod backend;
pub mod builtin;
pub mod http;
pub mod proxy;
pub mod transform;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;

pub use backend::{function_error, Backend, BackendError, FnBackend, HttpFunctionBackend};
pub use builtin::{BuiltinBackend, BuiltinFunction};
pub use http::HttpProxy;
pub use transform::{ErrorMapping, ResponseMapping};

use crate::auth::AuthContext;
use crate::request::{InboundRequest, OutboundResponse};

/// Hard ceiling for any invocation.
pub const MAX_TIMEOUT: Duration = Duration::from_millis(29_000);
pub const MIN_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationKind {
    ProxyInvoke,
    TransformInvoke,
    HttpProxy,
}

impl IntegrationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationKind::ProxyInvoke => "proxy",
            IntegrationKind::TransformInvoke => "transform",
            IntegrationKind::HttpProxy => "http",
        }
    }
}

pub enum Integration {
    /// The full request goes to the backend; its answer must be a proxy response.
    Proxy { backend: Arc<dyn Backend> },
    /// Request and response are mapped through templates.
    Transform {
        backend: Arc<dyn Backend>,
        request_template: Option<serde_json::Value>,
        response: ResponseMapping,
    },
    /// Plain HTTP passthrough.
    Http(HttpProxy),
}

impl Integration {
    pub fn kind(&self) -> IntegrationKind {
        match self {
            Integration::Proxy { .. } => IntegrationKind::ProxyInvoke,
            Integration::Transform { .. } => IntegrationKind::TransformInvoke,
            Integration::Http(_) => IntegrationKind::HttpProxy,
        }
    }
}

/// Opt-in retry for idempotent requests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Full-jitter exponential backoff before attempt `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let cap = exp.min(self.max_delay_ms);
        Duration::from_millis(rand::rng().random_range(0..=cap))
    }
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("integration timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("malformed integration response: {0}")]
    MalformedResponse(String),

    #[error("integration transform failed: {0}")]
    TransformFailed(String),

    /// The request cannot be mapped onto the upstream URL.
    #[error("invalid upstream path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl IntegrationError {
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrationError::Timeout(_) => "timeout",
            IntegrationError::MalformedResponse(_) => "malformed_response",
            IntegrationError::TransformFailed(_) => "transform_failed",
            IntegrationError::InvalidPath(_) => "invalid_path",
            IntegrationError::Backend(e) => e.kind(),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, IntegrationError::Backend(e) if e.is_retryable())
    }
}

/// Everything an integration may read about the request being served.
pub struct InvocationContext<'a> {
    pub request: &'a InboundRequest,
    pub stage: &'a str,
    /// Route pattern, e.g. `/pets/{id}`.
    pub resource: &'a str,
    pub path_params: &'a BTreeMap<String, String>,
    pub auth: &'a AuthContext,
    /// Header the route's authorizer read its credential from. Passthrough
    /// never forwards it.
    pub credential_header: Option<&'a str>,
}

#[derive(Clone, Default)]
pub struct IntegrationInvoker {
    http: reqwest::Client,
}

impl IntegrationInvoker {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Invoke `integration` within `timeout`, retrying per `retry` when the
    /// request is idempotent. All attempts share the one deadline.
    pub async fn invoke(
        &self,
        integration: &Integration,
        ctx: &InvocationContext<'_>,
        timeout: Duration,
        retry: Option<&RetryPolicy>,
    ) -> Result<OutboundResponse, IntegrationError> {
        let timeout = timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let retry = retry.filter(|_| ctx.request.is_idempotent());

        match tokio::time::timeout_at(deadline, self.invoke_with_retry(integration, ctx, retry)).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::Timeout(timeout)),
        }
    }

    async fn invoke_with_retry(
        &self,
        integration: &Integration,
        ctx: &InvocationContext<'_>,
        retry: Option<&RetryPolicy>,
    ) -> Result<OutboundResponse, IntegrationError> {
        let max_attempts = retry.map_or(1, |policy| policy.max_attempts.max(1));
        let mut attempt = 1;
        loop {
            match self.invoke_once(integration, ctx).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = retry.map(|policy| policy.backoff(attempt)).unwrap_or_default();
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying integration");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn invoke_once(
        &self,
        integration: &Integration,
        ctx: &InvocationContext<'_>,
    ) -> Result<OutboundResponse, IntegrationError> {
        match integration {
            Integration::Proxy { backend } => {
                let event = proxy::build_event(ctx);
                let answer = backend.invoke(event).await?;
                proxy::parse_response(&answer)
            }
            Integration::Transform {
                backend,
                request_template,
                response,
            } => {
                let payload = transform::render_request(request_template.as_ref(), ctx)?;
                match backend.invoke(payload).await {
                    Ok(result) => response.render_success(&result),
                    Err(BackendError::Function { message, error_type }) => {
                        match response.render_error(&message)? {
                            Some(mapped) => Ok(mapped),
                            None => Err(BackendError::Function { message, error_type }.into()),
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Integration::Http(proxy) => proxy.forward(&self.http, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context<'a>(request: &'a InboundRequest, params: &'a BTreeMap<String, String>, auth: &'a AuthContext) -> InvocationContext<'a> {
        InvocationContext {
            request,
            stage: "prod",
            resource: "/hello",
            path_params: params,
            auth,
            credential_header: None,
        }
    }

    fn flaky(failures: usize) -> (Arc<AtomicUsize>, Arc<dyn Backend>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let backend = FnBackend::new("flaky", move |_event: Value| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(BackendError::Unavailable("cold start".into()))
                } else {
                    Ok(json!({"statusCode": 200, "body": "ok"}))
                }
            }
        });
        (calls, Arc::new(backend))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn proxy_invocation_uses_backend_answer() {
        let backend: Arc<dyn Backend> = Arc::new(BuiltinBackend::new("hello", BuiltinFunction::HelloProxy));
        let integration = Integration::Proxy { backend };
        let request = InboundRequest::new("GET", "/hello?name=Ada");
        let (params, auth) = (BTreeMap::new(), AuthContext::default());

        let response = IntegrationInvoker::default()
            .invoke(&integration, &context(&request, &params, &auth), Duration::from_secs(1), None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "Hello, Ada! Your request was successful.");
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = FnBackend::new("slow", |_event: Value| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!({"statusCode": 200}))
        });
        let integration = Integration::Proxy {
            backend: Arc::new(backend),
        };
        let request = InboundRequest::new("GET", "/hello");
        let (params, auth) = (BTreeMap::new(), AuthContext::default());

        let started = std::time::Instant::now();
        let result = IntegrationInvoker::default()
            .invoke(&integration, &context(&request, &params, &auth), Duration::from_millis(100), None)
            .await;

        assert!(matches!(result, Err(IntegrationError::Timeout(d)) if d == Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn idempotent_requests_retry_unavailable_backends() {
        let (calls, backend) = flaky(2);
        let integration = Integration::Proxy { backend };
        let request = InboundRequest::new("GET", "/hello");
        let (params, auth) = (BTreeMap::new(), AuthContext::default());

        let response = IntegrationInvoker::default()
            .invoke(&integration, &context(&request, &params, &auth), Duration::from_secs(2), Some(&fast_retry()))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_idempotent_requests_never_retry() {
        let (calls, backend) = flaky(1);
        let integration = Integration::Proxy { backend };
        let request = InboundRequest::new("POST", "/hello");
        let (params, auth) = (BTreeMap::new(), AuthContext::default());

        let result = IntegrationInvoker::default()
            .invoke(&integration, &context(&request, &params, &auth), Duration::from_secs(2), Some(&fast_retry()))
            .await;
        assert!(matches!(result, Err(IntegrationError::Backend(BackendError::Unavailable(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let (calls, backend) = flaky(10);
        let integration = Integration::Proxy { backend };
        let request = InboundRequest::new("GET", "/hello");
        let (params, auth) = (BTreeMap::new(), AuthContext::default());

        let result = IntegrationInvoker::default()
            .invoke(&integration, &context(&request, &params, &auth), Duration::from_secs(2), Some(&fast_retry()))
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transform_maps_function_errors() {
        let backend = FnBackend::new("pets", |_payload: Value| async {
            Err(BackendError::Function {
                message: "NotFound: pet 7".into(),
                error_type: None,
            })
        });
        let response: ResponseMapping = serde_json::from_value(json!({
            "error_mappings": [{"pattern": "^NotFound", "status_code": 404}]
        }))
        .unwrap();
        let integration = Integration::Transform {
            backend: Arc::new(backend),
            request_template: None,
            response,
        };
        let request = InboundRequest::new("GET", "/pets/7");
        let (params, auth) = (BTreeMap::new(), AuthContext::default());

        let mapped = IntegrationInvoker::default()
            .invoke(&integration, &context(&request, &params, &auth), Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(mapped.status, 404);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        for attempt in 1..10 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(250));
        }
        assert!(RetryPolicy::default().backoff(1) <= Duration::from_millis(50));
    }
}
