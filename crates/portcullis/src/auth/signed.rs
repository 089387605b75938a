//! Signed-request authorizer (SigV4).

use std::collections::{BTreeMap, HashMap};

use portcullis_sigv4::{parse_authorization, verify, SigningConfig, VerifyRequest};

use super::{AuthDecision, AuthError};
use crate::request::InboundRequest;

const AUTHORIZATION: &str = "authorization";

pub struct SignedRequestAuthorizer {
    region: String,
    service: String,
    /// Access key id to secret.
    credentials: HashMap<String, String>,
    max_skew_secs: u64,
}

impl SignedRequestAuthorizer {
    pub fn new(
        region: impl Into<String>,
        service: impl Into<String>,
        credentials: HashMap<String, String>,
        max_skew_secs: u64,
    ) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            credentials,
            max_skew_secs,
        }
    }

    pub fn authorize(&self, request: &InboundRequest, now_unix: u64) -> Result<AuthDecision, AuthError> {
        let header = request
            .header(AUTHORIZATION)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| AuthError::MissingCredential(AUTHORIZATION.to_string()))?;

        let auth = match parse_authorization(header) {
            Ok(auth) => auth,
            Err(e) => return Ok(AuthDecision::deny("", e.to_string())),
        };

        let Some(secret) = self.credentials.get(&auth.access_key_id) else {
            return Ok(AuthDecision::deny(auth.access_key_id, "unknown access key"));
        };

        let config = SigningConfig {
            region: &self.region,
            service: &self.service,
        };
        let verify_request = VerifyRequest {
            method: &request.method,
            path: &request.path,
            query: request.raw_query.as_deref(),
            headers: &request.headers,
            body: &request.body,
        };

        match verify(&verify_request, &auth, secret, &config, now_unix, self.max_skew_secs) {
            Ok(()) => {
                let context = BTreeMap::from([("accessKeyId".to_string(), auth.access_key_id.clone())]);
                Ok(AuthDecision::allow(auth.access_key_id).with_context(context))
            }
            Err(e) => Ok(AuthDecision::deny(auth.access_key_id, e.to_string())),
        }
    }
}
