//! Proxy-invoke event and response shapes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};

use super::{IntegrationError, InvocationContext};
use crate::request::OutboundResponse;

/// Build the event handed to a proxy backend.
pub fn build_event(ctx: &InvocationContext<'_>) -> Value {
    let request = ctx.request;

    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    // Single-value view: the first occurrence of each parameter wins.
    let mut query = Map::new();
    for (k, v) in &request.query {
        query.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
    }

    let path_params: Map<String, Value> = ctx
        .path_params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut authorizer = Map::new();
    if let Some(principal) = &ctx.auth.principal_id {
        authorizer.insert("principalId".into(), Value::String(principal.clone()));
    }
    for (k, v) in &ctx.auth.context {
        authorizer.insert(k.clone(), Value::String(v.clone()));
    }

    let (body, is_base64) = match std::str::from_utf8(&request.body) {
        _ if request.body.is_empty() => (Value::Null, false),
        Ok(text) => (Value::String(text.to_string()), false),
        Err(_) => (Value::String(STANDARD.encode(&request.body)), true),
    };

    let non_empty = |map: Map<String, Value>| {
        if map.is_empty() {
            Value::Null
        } else {
            Value::Object(map)
        }
    };

    json!({
        "resource": ctx.resource,
        "path": request.path,
        "httpMethod": request.method,
        "headers": headers,
        "queryStringParameters": non_empty(query),
        "pathParameters": non_empty(path_params),
        "requestContext": {
            "stage": ctx.stage,
            "requestId": request.request_id,
            "resourcePath": ctx.resource,
            "httpMethod": request.method,
            "identity": { "sourceIp": request.client_ip() },
            "authorizer": non_empty(authorizer),
        },
        "body": body,
        "isBase64Encoded": is_base64,
    })
}

/// Validate and convert a proxy backend answer.
pub fn parse_response(answer: &Value) -> Result<OutboundResponse, IntegrationError> {
    let malformed = |msg: &str| IntegrationError::MalformedResponse(msg.to_string());

    let object = answer
        .as_object()
        .ok_or_else(|| malformed("response must be an object"))?;

    let status = object
        .get("statusCode")
        .and_then(Value::as_u64)
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| malformed("statusCode must be an integer between 100 and 599"))?;

    let mut response = OutboundResponse::new(status as u16);

    match object.get("headers") {
        None | Some(Value::Null) => {}
        Some(Value::Object(headers)) => {
            for (name, value) in headers {
                let value = value
                    .as_str()
                    .ok_or_else(|| malformed("header values must be strings"))?;
                response = response.with_header(name, value);
            }
        }
        Some(_) => return Err(malformed("headers must be an object")),
    }

    let is_base64 = match object.get("isBase64Encoded") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Err(malformed("isBase64Encoded must be a boolean")),
    };

    match object.get("body") {
        None | Some(Value::Null) => {}
        Some(Value::String(body)) if is_base64 => {
            let bytes = STANDARD
                .decode(body)
                .map_err(|e| IntegrationError::MalformedResponse(format!("body is not valid base64: {}", e)))?;
            response = response.with_body(bytes);
        }
        Some(Value::String(body)) => response = response.with_body(body.clone()),
        Some(_) => return Err(malformed("body must be a string")),
    }

    Ok(response)
}
