//! Route descriptors.

use std::sync::Arc;
use std::time::Duration;

use portcullis_validator::RequestValidator;

use crate::auth::Authorizer;
use crate::cache::CachePolicy;
use crate::integration::{Integration, RetryPolicy, MAX_TIMEOUT};

/// One published route. Immutable once it belongs to a stage.
pub struct Route {
    /// Upper-case method, or `ANY`.
    pub method: String,
    /// Path template, e.g. `/pets/{id}` or `/files/{path+}`.
    pub path: String,
    pub integration: Integration,
    pub authorizer: Option<Arc<Authorizer>>,
    pub validator: Option<Arc<RequestValidator>>,
    pub cache: Option<CachePolicy>,
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
}

impl Route {
    pub fn new(method: &str, path: impl Into<String>, integration: Integration) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.into(),
            integration,
            authorizer: None,
            validator: None,
            cache: None,
            timeout: MAX_TIMEOUT,
            retry: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_validator(mut self, validator: Arc<RequestValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Stable identity across stages: `METHOD path`.
    pub fn id(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Resource identifier handed to authorizers: `<stage>/<METHOD><path>`.
    pub fn resource_identifier(&self, stage: &str) -> String {
        format!("{}/{}{}", stage, self.method, self.path)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("integration", &self.integration.kind())
            .field("authorizer", &self.authorizer.as_ref().map(|a| a.name.as_str()))
            .field("timeout", &self.timeout)
            .finish()
    }
}
