//! Authorizers: turn a request credential into an allow/deny decision.
//!
//! The variant set is closed. Every variant fails closed: anything short of
//! a positive decision is a Deny, and only a malformed decision from a
//! delegated backend is surfaced as an error of its own.

pub mod decision_cache;
pub mod delegated;
pub mod key;
pub mod signed;

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

pub use decision_cache::DecisionCache;
pub use delegated::DelegatedAuthorizer;
pub use key::{KeyAuthorizer, KeyIdentity};
pub use signed::SignedRequestAuthorizer;

use crate::request::InboundRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// Outcome of an authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthDecision {
    pub principal_id: String,
    pub effect: Effect,
    pub context: BTreeMap<String, String>,
    /// Set when the decision came from (or went into) a decision cache.
    pub expires_at: Option<Instant>,
    /// Why a Deny was issued. Logged, never sent to the client.
    pub reason: Option<String>,
}

impl AuthDecision {
    pub fn allow(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            effect: Effect::Allow,
            context: BTreeMap::new(),
            expires_at: None,
            reason: None,
        }
    }

    pub fn deny(principal_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            effect: Effect::Deny,
            context: BTreeMap::new(),
            expires_at: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }
}

/// Caller identity handed to integrations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthContext {
    pub principal_id: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl From<&AuthDecision> for AuthContext {
    fn from(decision: &AuthDecision) -> Self {
        Self {
            principal_id: Some(decision.principal_id.clone()),
            context: decision.context.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing credential in '{0}'")]
    MissingCredential(String),

    /// The delegated backend answered, but not with a valid decision.
    #[error("authorizer returned a malformed decision: {0}")]
    ContractViolation(String),
}

pub enum AuthorizerKind {
    ApiKey(KeyAuthorizer),
    Delegated(DelegatedAuthorizer),
    SignedRequest(SignedRequestAuthorizer),
}

/// A named authorizer, shared by every route (in every stage) that uses it.
pub struct Authorizer {
    pub name: String,
    pub kind: AuthorizerKind,
}

impl Authorizer {
    pub fn new(name: impl Into<String>, kind: AuthorizerKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            AuthorizerKind::ApiKey(_) => "api_key",
            AuthorizerKind::Delegated(_) => "delegated",
            AuthorizerKind::SignedRequest(_) => "signed_request",
        }
    }

    /// Request header the credential is read from.
    pub fn credential_header(&self) -> &str {
        match &self.kind {
            AuthorizerKind::ApiKey(authorizer) => authorizer.header(),
            AuthorizerKind::Delegated(authorizer) => authorizer.identity_header(),
            AuthorizerKind::SignedRequest(_) => "authorization",
        }
    }

    /// Extract the credential this authorizer reads and decide.
    ///
    /// `resource` is the `<stage>/<METHOD>/<route pattern>` identifier.
    pub async fn authorize(&self, request: &InboundRequest, resource: &str) -> Result<AuthDecision, AuthError> {
        match &self.kind {
            AuthorizerKind::ApiKey(authorizer) => {
                let key = credential(request, authorizer.header())?;
                Ok(authorizer.authorize(key))
            }
            AuthorizerKind::Delegated(authorizer) => {
                let token = credential(request, authorizer.identity_header())?;
                authorizer.authorize(token, resource).await
            }
            AuthorizerKind::SignedRequest(authorizer) => authorizer.authorize(request, unix_now()),
        }
    }

    /// The API key identity presented on `request`, if this is a key
    /// authorizer and the key is known.
    pub fn key_identity(&self, request: &InboundRequest) -> Option<&KeyIdentity> {
        match &self.kind {
            AuthorizerKind::ApiKey(authorizer) => request
                .header(authorizer.header())
                .and_then(|key| authorizer.identify(key)),
            _ => None,
        }
    }
}

fn credential<'a>(request: &'a InboundRequest, header: &str) -> Result<&'a str, AuthError> {
    request
        .header(header)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::MissingCredential(header.to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
