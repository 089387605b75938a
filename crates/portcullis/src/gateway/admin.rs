//! Reserved `/__portcullis/*` endpoints.
//!
//! `health` and `metrics` are public. The stage endpoints exist only when
//! an admin token is configured and require `Authorization: Bearer <token>`.

use std::time::UNIX_EPOCH;

use hmac::{Hmac, Mac};
use portcullis_telemetry::PROMETHEUS_CONTENT_TYPE;
use serde_json::{json, Value};
use sha2::Sha256;

use super::{Gateway, RESERVED_PREFIX};
use crate::config::StageDefinition;
use crate::error::GatewayError;
use crate::request::{InboundRequest, OutboundResponse};
use crate::stage::Stage;

pub(super) async fn handle(gateway: &Gateway, request: &InboundRequest) -> Result<OutboundResponse, GatewayError> {
    let path = request.path.trim_start_matches(RESERVED_PREFIX).trim_end_matches('/');
    let method = request.method.as_str();

    match path {
        "health" | "metrics" if method != "GET" => Err(not_allowed(&["GET"])),
        "health" => Ok(health(gateway)),
        "metrics" => Ok(OutboundResponse::new(200)
            .with_header("content-type", PROMETHEUS_CONTENT_TYPE)
            .with_body(gateway.metrics().render())),
        "stages" => {
            authenticate(gateway, request)?;
            match method {
                "GET" => Ok(list_stages(gateway)),
                "POST" => publish(gateway, request),
                _ => Err(not_allowed(&["GET", "POST"])),
            }
        }
        _ => match path.strip_prefix("stages/") {
            Some(raw) => {
                authenticate(gateway, request)?;
                let version: u64 = raw.parse().map_err(|_| GatewayError::RouteNotFound)?;
                match method {
                    "GET" => gateway
                        .stages()
                        .get(version)
                        .map(|stage| OutboundResponse::json(200, &describe(gateway, &stage)))
                        .ok_or(GatewayError::StageNotFound(version)),
                    "DELETE" => {
                        gateway.retire(version)?;
                        Ok(OutboundResponse::new(204))
                    }
                    _ => Err(not_allowed(&["DELETE", "GET"])),
                }
            }
            None => Err(GatewayError::RouteNotFound),
        },
    }
    .map(|response| response.with_header("cache-control", "no-store"))
}

fn not_allowed(allowed: &[&str]) -> GatewayError {
    GatewayError::MethodNotAllowed {
        allowed: allowed.iter().map(|m| m.to_string()).collect(),
    }
}

fn health(gateway: &Gateway) -> OutboundResponse {
    let active = gateway.stages().active();
    let body = json!({
        "status": if active.is_some() { "healthy" } else { "no_active_stage" },
        "stage": gateway.settings().stage,
        "active_version": active.map(|s| s.version),
    });
    OutboundResponse::json(200, &body)
}

/// Without a configured token the stage endpoints do not exist.
fn authenticate(gateway: &Gateway, request: &InboundRequest) -> Result<(), GatewayError> {
    let Some(expected) = gateway.settings().admin_token.as_deref() else {
        return Err(GatewayError::RouteNotFound);
    };
    let presented = request
        .header("authorization")
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| GatewayError::Unauthorized("authorization".into()))?;

    if token_matches(expected, presented) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden {
            reason: "invalid admin token".into(),
        })
    }
}

/// Constant-time token comparison: both sides are reduced to fixed-size
/// MACs and compared with `verify_slice`.
fn token_matches(expected: &str, presented: &str) -> bool {
    let mac = |token: &str| {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"portcullis-admin-token").expect("HMAC accepts any key length");
        mac.update(token.as_bytes());
        mac
    };
    let expected_tag = mac(expected).finalize().into_bytes();
    mac(presented).verify_slice(&expected_tag).is_ok()
}

fn list_stages(gateway: &Gateway) -> OutboundResponse {
    let stages: Vec<Value> = gateway
        .stages()
        .list()
        .iter()
        .map(|stage| describe(gateway, stage))
        .collect();
    OutboundResponse::json(200, &json!({ "stages": stages }))
}

fn publish(gateway: &Gateway, request: &InboundRequest) -> Result<OutboundResponse, GatewayError> {
    let definition: StageDefinition = serde_json::from_slice(&request.body)
        .map_err(|e| GatewayError::InvalidStage(e.to_string()))?;
    let stage = gateway.publish_definitions(&definition.routes)?;
    Ok(OutboundResponse::json(201, &json!({ "version": stage.version }))
        .with_header("location", format!("{}stages/{}", RESERVED_PREFIX, stage.version)))
}

fn describe(gateway: &Gateway, stage: &Stage) -> Value {
    let active = gateway
        .stages()
        .active()
        .is_some_and(|a| a.version == stage.version);
    let published_at = stage
        .published_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let routes: Vec<Value> = stage
        .routes()
        .iter()
        .map(|route| {
            json!({
                "method": route.method,
                "path": route.path,
                "integration": route.integration.kind().as_str(),
                "authorizer": route.authorizer.as_ref().map(|a| a.name.as_str()),
                "cached": route.cache.is_some(),
                "timeout_ms": route.timeout.as_millis() as u64,
            })
        })
        .collect();

    json!({
        "version": stage.version,
        "label": stage.label,
        "active": active,
        "published_at": published_at,
        "routes": routes,
    })
}
