//! Static API key authorizer.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use super::AuthDecision;

/// Identity bound to one API key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyIdentity {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Usage plan whose throttle limits apply to this key.
    #[serde(default)]
    pub usage_plan: Option<String>,
    /// Extra values merged into the authorizer context.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

pub struct KeyAuthorizer {
    header: String,
    keys: HashMap<String, KeyIdentity>,
}

impl KeyAuthorizer {
    /// `keys` maps the raw key value to its identity.
    pub fn new(header: impl Into<String>, keys: HashMap<String, KeyIdentity>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
            keys,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn identify(&self, key: &str) -> Option<&KeyIdentity> {
        self.keys.get(key)
    }

    pub fn identities(&self) -> impl Iterator<Item = &KeyIdentity> {
        self.keys.values()
    }

    pub fn authorize(&self, key: &str) -> AuthDecision {
        match self.identify(key) {
            Some(identity) if identity.enabled => {
                let mut context = identity.context.clone();
                context.insert("keyId".into(), identity.id.clone());
                if let Some(plan) = &identity.usage_plan {
                    context.insert("usagePlan".into(), plan.clone());
                }
                AuthDecision::allow(identity.id.clone()).with_context(context)
            }
            Some(identity) => AuthDecision::deny(identity.id.clone(), "key disabled"),
            None => AuthDecision::deny("", "unknown key"),
        }
    }
}
