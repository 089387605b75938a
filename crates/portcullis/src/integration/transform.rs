//! Request and response mapping templates for transform integrations.
//!
//! A template is any JSON value. String leaves that are exactly one variable
//! (`$input.body.name`) are replaced by the variable's typed value; other
//! strings have their `${…}` occurrences interpolated as text. Variables:
//!
//! - `$input.body`, `$input.body.<dotted path>` - the parsed JSON body
//! - `$input.path.<name>`, `$input.query.<name>`, `$input.header.<name>`
//! - `$context.principalId`, `$context.requestId`, `$context.stage`,
//!   `$context.sourceIp`, `$context.httpMethod`, `$context.resourcePath`,
//!   `$context.authorizer.<key>`
//! - `$result`, `$result.<dotted path>` - the backend result (response side)

use std::collections::BTreeMap;

use portcullis_validator::Pattern;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{IntegrationError, InvocationContext};
use crate::request::OutboundResponse;

/// How a backend result becomes a client response.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponseMapping {
    pub status_code: u16,
    /// Header templates over `$result`.
    pub headers: BTreeMap<String, String>,
    /// Body template over `$result`. Without one the result is sent as is.
    pub body: Option<Value>,
    /// Checked in order against the message of a function error.
    pub error_mappings: Vec<ErrorMapping>,
}

impl Default for ResponseMapping {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: BTreeMap::new(),
            body: None,
            error_mappings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorMapping {
    pub pattern: Pattern,
    pub status_code: u16,
    /// Body template; `$result.errorMessage` holds the message.
    #[serde(default)]
    pub body: Option<Value>,
}

impl ResponseMapping {
    pub fn render_success(&self, result: &Value) -> Result<OutboundResponse, IntegrationError> {
        self.render(self.status_code, self.body.as_ref(), result)
    }

    /// Map a function error message, if any mapping matches it.
    pub fn render_error(&self, message: &str) -> Result<Option<OutboundResponse>, IntegrationError> {
        let Some(mapping) = self.error_mappings.iter().find(|m| m.pattern.is_match(message)) else {
            return Ok(None);
        };
        let result = serde_json::json!({ "errorMessage": message });
        let body = mapping
            .body
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "message": "$result.errorMessage" }));
        self.render(mapping.status_code, Some(&body), &result).map(Some)
    }

    fn render(&self, status: u16, body: Option<&Value>, result: &Value) -> Result<OutboundResponse, IntegrationError> {
        let resolve = |var: &str| resolve_result(var, result);
        let body = match body {
            Some(template) => render(template, &resolve)?,
            None => result.clone(),
        };

        let mut response = OutboundResponse::json(status, &body);
        for (name, template) in &self.headers {
            response = response.with_header(name, interpolate(template, &resolve)?);
        }
        Ok(response)
    }
}

/// Build the backend payload for a transform integration.
pub fn render_request(template: Option<&Value>, ctx: &InvocationContext<'_>) -> Result<Value, IntegrationError> {
    let body = parse_body(ctx)?;
    match template {
        None => Ok(if body.is_null() {
            Value::Object(Map::new())
        } else {
            body
        }),
        Some(template) => render(template, &|var: &str| resolve_input(var, ctx, &body)),
    }
}

fn parse_body(ctx: &InvocationContext<'_>) -> Result<Value, IntegrationError> {
    if ctx.request.body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&ctx.request.body)
        .map_err(|e| IntegrationError::TransformFailed(format!("request body is not JSON: {}", e)))
}

fn resolve_input(var: &str, ctx: &InvocationContext<'_>, body: &Value) -> Result<Value, IntegrationError> {
    let text = |v: Option<&str>| v.map_or(Value::Null, |s| Value::String(s.to_string()));
    let request = ctx.request;

    if var == "$input.body" {
        return Ok(body.clone());
    }
    if let Some(path) = var.strip_prefix("$input.body.") {
        return Ok(lookup(body, path));
    }
    if let Some(name) = var.strip_prefix("$input.path.") {
        return Ok(text(ctx.path_params.get(name).map(String::as_str)));
    }
    if let Some(name) = var.strip_prefix("$input.query.") {
        return Ok(text(request.query_param(name)));
    }
    if let Some(name) = var.strip_prefix("$input.header.") {
        return Ok(text(request.header(name)));
    }
    if let Some(key) = var.strip_prefix("$context.authorizer.") {
        return Ok(text(ctx.auth.context.get(key).map(String::as_str)));
    }

    match var {
        "$context.principalId" => Ok(text(ctx.auth.principal_id.as_deref())),
        "$context.requestId" => Ok(text(Some(&request.request_id))),
        "$context.stage" => Ok(text(Some(ctx.stage))),
        "$context.sourceIp" => Ok(text(request.client_ip().as_deref())),
        "$context.httpMethod" => Ok(text(Some(&request.method))),
        "$context.resourcePath" => Ok(text(Some(ctx.resource))),
        _ => Err(unknown(var)),
    }
}

fn resolve_result(var: &str, result: &Value) -> Result<Value, IntegrationError> {
    if var == "$result" {
        return Ok(result.clone());
    }
    match var.strip_prefix("$result.") {
        Some(path) => Ok(lookup(result, path)),
        None => Err(unknown(var)),
    }
}

fn unknown(var: &str) -> IntegrationError {
    IntegrationError::TransformFailed(format!("unknown variable '{}'", var))
}

/// Walk a dotted path; numeric segments index arrays. Missing is null.
fn lookup(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

type Resolver<'a> = dyn Fn(&str) -> Result<Value, IntegrationError> + 'a;

fn render(template: &Value, resolve: &Resolver<'_>) -> Result<Value, IntegrationError> {
    match template {
        Value::String(s) if is_variable(s) => resolve(s),
        Value::String(s) => interpolate(s, resolve).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, resolve))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render(v, resolve)?)))
            .collect::<Result<Map<_, _>, IntegrationError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn is_variable(s: &str) -> bool {
    s.starts_with('$') && !s.starts_with("${") && !s.contains(char::is_whitespace)
}

/// Replace each `${var}` (or `${$var}`) with the variable's text form.
fn interpolate(template: &str, resolve: &Resolver<'_>) -> Result<String, IntegrationError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            IntegrationError::TransformFailed(format!("unterminated '${{' in '{}'", template))
        })?;
        let inner = after[..end].trim();
        let var = if inner.starts_with('$') {
            inner.to_string()
        } else {
            format!("${}", inner)
        };
        match resolve(&var)? {
            Value::Null => {}
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use crate::request::InboundRequest;
    use serde_json::json;

    fn with_ctx<R>(request: &InboundRequest, f: impl FnOnce(&InvocationContext<'_>) -> R) -> R {
        let params = BTreeMap::from([("id".to_string(), "42".to_string())]);
        let auth = AuthContext {
            principal_id: Some("user-9".into()),
            context: BTreeMap::from([("tenant".to_string(), "acme".to_string())]),
        };
        let ctx = InvocationContext {
            request,
            stage: "prod",
            resource: "/orders/{id}",
            path_params: &params,
            auth: &auth,
            credential_header: None,
        };
        f(&ctx)
    }

    #[test]
    fn typed_variables_and_interpolation() {
        let request = InboundRequest::new("POST", "/orders/42?name=Ada")
            .with_header("X-Client", "cli")
            .with_body(r#"{"qty": 3, "items": [{"sku": "A-1"}]}"#)
            .with_request_id("r-1");
        let template = json!({
            "order": "$input.path.id",
            "qty": "$input.body.qty",
            "firstSku": "$input.body.items.0.sku",
            "name": "$input.query.name",
            "client": "$input.header.x-client",
            "who": "$context.principalId",
            "tenant": "$context.authorizer.tenant",
            "summary": "${context.stage}/${input.path.id} x${input.body.qty}",
            "missing": "$input.query.nope",
            "literal": 7
        });

        let payload = with_ctx(&request, |ctx| render_request(Some(&template), ctx)).unwrap();
        assert_eq!(
            payload,
            json!({
                "order": "42",
                "qty": 3,
                "firstSku": "A-1",
                "name": "Ada",
                "client": "cli",
                "who": "user-9",
                "tenant": "acme",
                "summary": "prod/42 x3",
                "missing": null,
                "literal": 7
            })
        );
    }

    #[test]
    fn without_template_body_passes_through() {
        let request = InboundRequest::new("POST", "/x").with_body(r#"{"name":"Grace"}"#);
        let payload = with_ctx(&request, |ctx| render_request(None, ctx)).unwrap();
        assert_eq!(payload, json!({"name": "Grace"}));

        let empty = InboundRequest::new("GET", "/x");
        assert_eq!(with_ctx(&empty, |ctx| render_request(None, ctx)).unwrap(), json!({}));
    }

    #[test]
    fn failures_are_transform_errors() {
        let not_json = InboundRequest::new("POST", "/x").with_body("name=Grace");
        assert!(matches!(
            with_ctx(&not_json, |ctx| render_request(None, ctx)),
            Err(IntegrationError::TransformFailed(_))
        ));

        let request = InboundRequest::new("GET", "/x");
        for template in [json!("$bogus.var"), json!("hello ${input.path.id")] {
            assert!(matches!(
                with_ctx(&request, |ctx| render_request(Some(&template), ctx)),
                Err(IntegrationError::TransformFailed(_))
            ));
        }
    }

    #[test]
    fn response_mapping_renders_result() {
        let mapping: ResponseMapping = serde_json::from_value(json!({
            "status_code": 201,
            "headers": {"x-greeting-for": "${result.name}"},
            "body": {"message": "$result.greeting"}
        }))
        .unwrap();

        let response = mapping
            .render_success(&json!({"greeting": "Hello from non-proxy, Ada!", "name": "Ada"}))
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.header("x-greeting-for"), Some("Ada"));
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body, json!({"message": "Hello from non-proxy, Ada!"}));
    }

    #[test]
    fn default_mapping_sends_result_as_json() {
        let response = ResponseMapping::default()
            .render_success(&json!({"greeting": "hi"}))
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(&response.body[..], br#"{"greeting":"hi"}"#);
    }

    #[test]
    fn error_mappings_match_in_order() {
        let mapping: ResponseMapping = serde_json::from_value(json!({
            "error_mappings": [
                {"pattern": "^NotFound", "status_code": 404},
                {"pattern": ".*", "status_code": 400, "body": {"error": "bad: ${result.errorMessage}"}}
            ]
        }))
        .unwrap();

        let not_found = mapping.render_error("NotFound: order 7").unwrap().unwrap();
        assert_eq!(not_found.status, 404);
        let body: Value = serde_json::from_slice(&not_found.body).unwrap();
        assert_eq!(body["message"], "NotFound: order 7");

        let other = mapping.render_error("boom").unwrap().unwrap();
        assert_eq!(other.status, 400);
        let body: Value = serde_json::from_slice(&other.body).unwrap();
        assert_eq!(body["error"], "bad: boom");

        assert!(ResponseMapping::default().render_error("boom").unwrap().is_none());
    }

    #[test]
    fn invalid_error_pattern_fails_to_load() {
        let result: Result<ResponseMapping, _> =
            serde_json::from_value(json!({"error_mappings": [{"pattern": "(", "status_code": 400}]}));
        assert!(result.is_err());
    }
}
