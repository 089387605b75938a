//! Delegated authorizer: asks a backend function for the decision.
//!
//! The function receives `{type, credential, resourceIdentifier}` and must
//! answer either with `{principalId, effect, context}` or with an IAM-style
//! `{principalId, policyDocument: {Statement: [...]}, context}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use portcullis_telemetry::log_authorizer_error;
use serde_json::{json, Map, Value};

use super::decision_cache::{cache_key, DecisionCache};
use super::{AuthDecision, AuthError, Effect};
use crate::integration::Backend;

pub struct DelegatedAuthorizer {
    backend: Arc<dyn Backend>,
    identity_header: String,
    timeout: Duration,
    cache: DecisionCache,
}

impl DelegatedAuthorizer {
    pub fn new(backend: Arc<dyn Backend>, identity_header: impl Into<String>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            identity_header: identity_header.into().to_ascii_lowercase(),
            timeout,
            cache: DecisionCache::new(ttl),
        }
    }

    pub fn identity_header(&self) -> &str {
        &self.identity_header
    }

    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    /// Decide for `credential` on `resource`, consulting the cache first.
    ///
    /// Backend failures yield an uncached Deny. A malformed answer is a
    /// contract violation and is not cached either.
    pub async fn authorize(&self, credential: &str, resource: &str) -> Result<AuthDecision, AuthError> {
        let key = cache_key(credential, resource);
        if let Some(decision) = self.cache.get(&key) {
            return Ok(decision);
        }

        let payload = json!({
            "type": "TOKEN",
            "credential": credential,
            "resourceIdentifier": resource,
        });

        let answer = match tokio::time::timeout(self.timeout, self.backend.invoke(payload)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                log_authorizer_error!(backend = %self.backend.name(), error = %e, "authorizer backend failed");
                return Ok(AuthDecision::deny("", format!("authorizer unavailable: {}", e)));
            }
            Err(_) => {
                log_authorizer_error!(
                    backend = %self.backend.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "authorizer backend timed out"
                );
                return Ok(AuthDecision::deny("", "authorizer timed out"));
            }
        };

        let decision = parse_decision(&answer, resource)?;
        Ok(self.cache.insert(key, decision))
    }
}

/// Parse a decision returned by an authorizer function.
pub fn parse_decision(answer: &Value, resource: &str) -> Result<AuthDecision, AuthError> {
    let violation = |msg: &str| AuthError::ContractViolation(msg.to_string());

    let object = answer
        .as_object()
        .ok_or_else(|| violation("decision must be a JSON object"))?;

    let principal_id = object
        .get("principalId")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| violation("principalId must be a non-empty string"))?;

    let effect = match (object.get("effect"), object.get("policyDocument")) {
        (Some(effect), _) => parse_effect(effect)?,
        (None, Some(policy)) => policy_effect(policy, resource)?,
        (None, None) => return Err(violation("decision needs an effect or a policyDocument")),
    };

    let context = match object.get("context") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => parse_context(map)?,
        Some(_) => return Err(violation("context must be an object")),
    };

    let decision = match effect {
        Effect::Allow => AuthDecision::allow(principal_id),
        Effect::Deny => AuthDecision::deny(principal_id, "denied by authorizer"),
    };
    Ok(decision.with_context(context))
}

fn parse_effect(value: &Value) -> Result<Effect, AuthError> {
    match value.as_str().map(str::to_ascii_lowercase).as_deref() {
        Some("allow") => Ok(Effect::Allow),
        Some("deny") => Ok(Effect::Deny),
        _ => Err(AuthError::ContractViolation(format!(
            "effect must be Allow or Deny, got {}",
            value
        ))),
    }
}

/// Evaluate an IAM-style policy: an explicit Deny on the resource wins,
/// then any Allow on it, otherwise Deny.
fn policy_effect(policy: &Value, resource: &str) -> Result<Effect, AuthError> {
    let statements = match policy.get("Statement") {
        Some(Value::Array(list)) => list.iter().collect::<Vec<_>>(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => {
            return Err(AuthError::ContractViolation(
                "policyDocument.Statement must be an object or array".into(),
            ))
        }
    };

    let mut allowed = false;
    for statement in statements {
        let effect = parse_effect(statement.get("Effect").unwrap_or(&Value::Null))?;
        let resources: Vec<&str> = match statement.get("Resource") {
            Some(Value::String(r)) => vec![r.as_str()],
            Some(Value::Array(list)) => list.iter().filter_map(Value::as_str).collect(),
            _ => {
                return Err(AuthError::ContractViolation(
                    "statement Resource must be a string or array".into(),
                ))
            }
        };

        if resources.iter().any(|pattern| resource_matches(pattern, resource)) {
            match effect {
                Effect::Deny => return Ok(Effect::Deny),
                Effect::Allow => allowed = true,
            }
        }
    }

    Ok(if allowed { Effect::Allow } else { Effect::Deny })
}

/// Glob match where `*` spans any run of characters, `/` included.
fn resource_matches(pattern: &str, resource: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == resource;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !resource.starts_with(first) || resource.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &resource[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Context values must be scalars; numbers and booleans are stringified.
fn parse_context(map: &Map<String, Value>) -> Result<BTreeMap<String, String>, AuthError> {
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(AuthError::ContractViolation(format!(
                        "context value '{}' must be a string, number or boolean",
                        key
                    )))
                }
            };
            Ok((key.clone(), value))
        })
        .collect()
}
