//! Gateway configuration file.
//!
//! One YAML (or JSON) document declares backends, authorizers, validators
//! and routes. Sections refer to each other by name; names are resolved
//! when the [`Catalog`] is built, so a dangling reference fails at load time
//! rather than on the first request.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use portcullis_validator::{RequestLimits, RequestValidator};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::auth::{Authorizer, AuthorizerKind, DelegatedAuthorizer, KeyAuthorizer, KeyIdentity, SignedRequestAuthorizer};
use crate::cache::CachePolicy;
use crate::integration::{
    Backend, BuiltinBackend, BuiltinFunction, HttpFunctionBackend, HttpProxy, Integration, ResponseMapping,
    RetryPolicy, MAX_TIMEOUT, MIN_TIMEOUT,
};
use crate::route::Route;
use crate::stage::StageError;
use crate::throttle::ThrottleLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("{context} refers to unknown {kind} '{name}'")]
    UnknownReference {
        kind: &'static str,
        name: String,
        context: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Stage(#[from] StageError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Stage label, used in resource identifiers and proxy events.
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub dev_mode: bool,
    /// Enables the admin endpoints when set.
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub limits: RequestLimits,
    /// Limits for callers without a usage plan.
    #[serde(default = "default_throttle")]
    pub throttle: ThrottleLimits,
    #[serde(default)]
    pub usage_plans: BTreeMap<String, ThrottleLimits>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub authorizers: BTreeMap<String, AuthorizerConfig>,
    #[serde(default)]
    pub validators: BTreeMap<String, RequestValidator>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_stage() -> String {
    "prod".into()
}

fn default_throttle() -> ThrottleLimits {
    ThrottleLimits {
        burst: 100,
        rate_per_second: 50.0,
        quota: None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A function reachable through an HTTPS function URL.
    Http {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Builtin { function: BuiltinFunction },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorizerConfig {
    ApiKey {
        #[serde(default = "default_key_header")]
        header: String,
        /// Raw key value to identity.
        keys: HashMap<String, KeyIdentity>,
    },
    Delegated {
        backend: String,
        #[serde(default = "default_identity_header")]
        identity_header: String,
        #[serde(default = "default_decision_ttl")]
        ttl_secs: u64,
        #[serde(default = "default_authorizer_timeout_ms")]
        timeout_ms: u64,
    },
    SignedRequest {
        region: String,
        service: String,
        /// Access key id to secret.
        credentials: HashMap<String, String>,
        #[serde(default = "default_max_skew")]
        max_skew_secs: u64,
    },
}

fn default_key_header() -> String {
    "x-api-key".into()
}

fn default_identity_header() -> String {
    "authorization".into()
}

fn default_decision_ttl() -> u64 {
    300
}

fn default_authorizer_timeout_ms() -> u64 {
    5_000
}

fn default_max_skew() -> u64 {
    900
}

fn default_timeout_ms() -> u64 {
    MAX_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub method: String,
    pub path: String,
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub authorizer: Option<String>,
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrationConfig {
    Proxy {
        backend: String,
    },
    Transform {
        backend: String,
        #[serde(default)]
        request_template: Option<Value>,
        #[serde(default)]
        response: ResponseMapping,
    },
    Http {
        url: String,
    },
}

/// Body of an admin publish request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Named backends, authorizers and validators, resolved once.
///
/// Authorizers live here rather than in a stage so that their decision
/// caches survive a redeploy.
#[derive(Default)]
pub struct Catalog {
    backends: HashMap<String, Arc<dyn Backend>>,
    authorizers: HashMap<String, Arc<Authorizer>>,
    validators: HashMap<String, Arc<RequestValidator>>,
}

impl Catalog {
    pub fn build(config: &GatewayConfig, http: &reqwest::Client) -> Result<Self, ConfigError> {
        config
            .throttle
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("throttle: {}", e)))?;
        for (name, plan) in &config.usage_plans {
            plan.validate()
                .map_err(|e| ConfigError::Invalid(format!("usage plan '{}': {}", name, e)))?;
        }

        let mut catalog = Catalog::default();

        for (name, backend) in &config.backends {
            let backend: Arc<dyn Backend> = match backend {
                BackendConfig::Http { url, timeout_ms } => Arc::new(HttpFunctionBackend::new(
                    name.clone(),
                    url.clone(),
                    clamp_timeout(*timeout_ms, &format!("backend '{}'", name))?,
                    http.clone(),
                )),
                BackendConfig::Builtin { function } => Arc::new(BuiltinBackend::new(name.clone(), *function)),
            };
            catalog.backends.insert(name.clone(), backend);
        }

        for (name, authorizer) in &config.authorizers {
            let context = format!("authorizer '{}'", name);
            let kind = match authorizer {
                AuthorizerConfig::ApiKey { header, keys } => {
                    for identity in keys.values() {
                        if let Some(plan) = &identity.usage_plan {
                            if !config.usage_plans.contains_key(plan) {
                                return Err(ConfigError::UnknownReference {
                                    kind: "usage plan",
                                    name: plan.clone(),
                                    context: format!("key '{}' of {}", identity.id, context),
                                });
                            }
                        }
                    }
                    AuthorizerKind::ApiKey(KeyAuthorizer::new(header.clone(), keys.clone()))
                }
                AuthorizerConfig::Delegated {
                    backend,
                    identity_header,
                    ttl_secs,
                    timeout_ms,
                } => AuthorizerKind::Delegated(DelegatedAuthorizer::new(
                    catalog.backend(backend, &context)?,
                    identity_header.clone(),
                    Duration::from_secs(*ttl_secs),
                    clamp_timeout(*timeout_ms, &context)?,
                )),
                AuthorizerConfig::SignedRequest {
                    region,
                    service,
                    credentials,
                    max_skew_secs,
                } => AuthorizerKind::SignedRequest(SignedRequestAuthorizer::new(
                    region.clone(),
                    service.clone(),
                    credentials.clone(),
                    *max_skew_secs,
                )),
            };
            catalog
                .authorizers
                .insert(name.clone(), Arc::new(Authorizer::new(name.clone(), kind)));
        }

        for (name, validator) in &config.validators {
            catalog
                .validators
                .insert(name.clone(), Arc::new(validator.clone()));
        }

        Ok(catalog)
    }

    fn backend(&self, name: &str, context: &str) -> Result<Arc<dyn Backend>, ConfigError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("backend", name, context))
    }

    pub fn authorizer(&self, name: &str) -> Option<&Arc<Authorizer>> {
        self.authorizers.get(name)
    }

    pub fn build_route(&self, config: &RouteConfig) -> Result<Route, ConfigError> {
        let context = format!("route {} {}", config.method, config.path);

        let integration = match &config.integration {
            IntegrationConfig::Proxy { backend } => Integration::Proxy {
                backend: self.backend(backend, &context)?,
            },
            IntegrationConfig::Transform {
                backend,
                request_template,
                response,
            } => Integration::Transform {
                backend: self.backend(backend, &context)?,
                request_template: request_template.clone(),
                response: response.clone(),
            },
            IntegrationConfig::Http { url } => Integration::Http(HttpProxy::new(url.clone())),
        };

        let mut route = Route::new(&config.method, config.path.clone(), integration)
            .with_timeout(clamp_timeout(config.timeout_ms, &context)?);

        if let Some(name) = &config.authorizer {
            let authorizer = self
                .authorizers
                .get(name)
                .ok_or_else(|| unknown("authorizer", name, &context))?;
            route = route.with_authorizer(Arc::clone(authorizer));
        }
        if let Some(name) = &config.validator {
            let validator = self
                .validators
                .get(name)
                .ok_or_else(|| unknown("validator", name, &context))?;
            route = route.with_validator(Arc::clone(validator));
        }
        if let Some(policy) = &config.cache {
            route = route.with_cache(policy.clone());
        }
        if let Some(retry) = &config.retry {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{}: retry.max_attempts must be at least 1", context)));
            }
            route = route.with_retry(retry.clone());
        }

        Ok(route)
    }

    pub fn build_routes(&self, routes: &[RouteConfig]) -> Result<Vec<Route>, ConfigError> {
        routes.iter().map(|route| self.build_route(route)).collect()
    }
}

fn unknown(kind: &'static str, name: &str, context: &str) -> ConfigError {
    ConfigError::UnknownReference {
        kind,
        name: name.to_string(),
        context: context.to_string(),
    }
}

/// Timeouts above the hard ceiling are clamped; below the floor is an error.
fn clamp_timeout(timeout_ms: u64, context: &str) -> Result<Duration, ConfigError> {
    let timeout = Duration::from_millis(timeout_ms);
    if timeout < MIN_TIMEOUT {
        return Err(ConfigError::Invalid(format!(
            "{}: timeout_ms must be at least {}",
            context,
            MIN_TIMEOUT.as_millis()
        )));
    }
    if timeout > MAX_TIMEOUT {
        tracing::warn!(
            context,
            timeout_ms,
            max_timeout_ms = MAX_TIMEOUT.as_millis() as u64,
            "timeout clamped to the hard ceiling"
        );
        return Ok(MAX_TIMEOUT);
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::IntegrationKind;
    use std::io::Write;

    const CONFIG: &str = r#"
stage: prod
usage_plans:
  gold: { burst: 50, rate_per_second: 10, quota: { limit: 10000, period: month } }
backends:
  hello: { type: builtin, function: hello_proxy }
  greet: { type: builtin, function: hello_transform }
  authz: { type: http, url: "http://authz.internal/invoke", timeout_ms: 2000 }
authorizers:
  keys:
    type: api_key
    keys:
      k-1: { id: acme, usage_plan: gold }
  tokens:
    type: delegated
    backend: authz
validators:
  person:
    body:
      type: object
      required: [name]
      properties:
        name: { type: string }
routes:
  - method: GET
    path: /hello
    integration: { type: proxy, backend: hello }
    cache: { ttl_secs: 60 }
  - method: post
    path: /greet
    authorizer: keys
    validator: person
    timeout_ms: 60000
    integration:
      type: transform
      backend: greet
      request_template: { name: "$input.body.name" }
      response: { status_code: 200 }
  - method: GET
    path: /upstream/{proxy+}
    authorizer: tokens
    integration: { type: http, url: "http://upstream.internal/{proxy+}" }
"#;

    #[test]
    fn loads_yaml_and_builds_routes() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.throttle.burst, 100);
        assert_eq!(config.usage_plans["gold"].burst, 50);

        let catalog = Catalog::build(&config, &reqwest::Client::new()).unwrap();
        let routes = catalog.build_routes(&config.routes).unwrap();
        assert_eq!(routes.len(), 3);

        assert_eq!(routes[0].integration.kind(), IntegrationKind::ProxyInvoke);
        assert_eq!(routes[0].cache.as_ref().map(|c| c.ttl_secs), Some(60));

        assert_eq!(routes[1].method, "POST");
        assert_eq!(routes[1].timeout, MAX_TIMEOUT);
        assert_eq!(routes[1].authorizer.as_ref().map(|a| a.kind_name()), Some("api_key"));
        assert!(routes[1].validator.is_some());

        assert_eq!(routes[2].authorizer.as_ref().map(|a| a.kind_name()), Some("delegated"));
    }

    #[test]
    fn authorizers_are_shared_between_builds() {
        let config = GatewayConfig::from_yaml(CONFIG).unwrap();
        let catalog = Catalog::build(&config, &reqwest::Client::new()).unwrap();
        let first = catalog.build_route(&config.routes[1]).unwrap();
        let second = catalog.build_route(&config.routes[1]).unwrap();
        assert!(Arc::ptr_eq(
            first.authorizer.as_ref().unwrap(),
            second.authorizer.as_ref().unwrap()
        ));
    }

    #[test]
    fn unknown_references_are_rejected() {
        let config = GatewayConfig::from_yaml(
            r#"
routes:
  - method: GET
    path: /x
    integration: { type: proxy, backend: nowhere }
"#,
        )
        .unwrap();
        let catalog = Catalog::build(&config, &reqwest::Client::new()).unwrap();
        let err = catalog.build_routes(&config.routes).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { kind: "backend", .. }));

        let bad_plan = GatewayConfig::from_yaml(
            r#"
authorizers:
  keys: { type: api_key, keys: { k: { id: a, usage_plan: platinum } } }
"#,
        )
        .unwrap();
        assert!(matches!(
            Catalog::build(&bad_plan, &reqwest::Client::new()),
            Err(ConfigError::UnknownReference { kind: "usage plan", .. })
        ));
    }

    #[test]
    fn too_short_timeout_is_invalid() {
        let config = GatewayConfig::from_yaml(
            r#"
routes:
  - method: GET
    path: /x
    timeout_ms: 10
    integration: { type: http, url: "http://x" }
"#,
        )
        .unwrap();
        let catalog = Catalog::build(&config, &reqwest::Client::new()).unwrap();
        assert!(matches!(catalog.build_routes(&config.routes), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_fields_and_bad_throttle_are_rejected() {
        assert!(matches!(
            GatewayConfig::from_yaml("stagee: prod"),
            Err(ConfigError::Parse(_))
        ));

        let config = GatewayConfig::from_yaml("throttle: { burst: 0, rate_per_second: 1 }").unwrap();
        assert!(matches!(
            Catalog::build(&config, &reqwest::Client::new()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"stage": "dev", "routes": [{{"method": "GET", "path": "/h", "integration": {{"type": "http", "url": "http://h"}}}}]}}"#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.stage, "dev");
        assert_eq!(config.routes.len(), 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
