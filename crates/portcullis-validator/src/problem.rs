//! RFC 9457 problem details.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::{FieldError, LimitViolation};

/// RFC 9457 problem details body.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Extension members (field errors, retry hints, ...).
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl ProblemDetails {
    /// Build a problem with the `urn:portcullis:error:<slug>` type.
    pub fn new(status: u16, slug: &str, title: impl Into<String>) -> Self {
        Self {
            error_type: format!("urn:portcullis:error:{}", slug),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// 400 problem listing every field error.
    ///
    /// Field errors are structural facts about the client's own request, so
    /// they are always included.
    pub fn validation_failed(errors: &[FieldError]) -> Self {
        let details: Vec<Value> = errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "location": e.location,
                    "field": e.path,
                    "reason": e.kind.to_string(),
                })
            })
            .collect();

        let detail = if errors.len() == 1 {
            errors[0].to_string()
        } else {
            format!("{} validation errors", errors.len())
        };

        Self::new(400, "validation-failed", "Request validation failed")
            .with_detail(detail)
            .with_extension("errors", Value::Array(details))
    }

    /// 400 problem for request limit violations.
    pub fn limits_exceeded(violations: &[LimitViolation]) -> Self {
        let reasons: Vec<Value> = violations
            .iter()
            .map(|v| Value::String(v.to_string()))
            .collect();

        let detail = match violations {
            [single] => single.to_string(),
            _ => format!("{} request limit violations", violations.len()),
        };

        Self::new(400, "request-limits", "Request exceeds gateway limits")
            .with_detail(detail)
            .with_extension("errors", Value::Array(reasons))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"urn:portcullis:error:internal","title":"Serialization error","status":500}"#
                .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldErrorKind, Location};

    #[test]
    fn validation_problem_lists_fields() {
        let errors = vec![
            FieldError::new(Location::Body, "email", FieldErrorKind::Required),
            FieldError::new(Location::Query, "page", FieldErrorKind::Required),
        ];
        let json: Value = serde_json::from_str(&ProblemDetails::validation_failed(&errors).to_json()).unwrap();

        assert_eq!(json["type"], "urn:portcullis:error:validation-failed");
        assert_eq!(json["status"], 400);
        assert_eq!(json["detail"], "2 validation errors");
        assert_eq!(json["errors"][0]["field"], "email");
        assert_eq!(json["errors"][1]["location"], "query");
    }

    #[test]
    fn single_error_detail_is_the_error_text() {
        let errors = vec![FieldError::new(Location::Header, "X-Tenant", FieldErrorKind::Required)];
        let problem = ProblemDetails::validation_failed(&errors);
        assert_eq!(problem.detail.as_deref(), Some("header field 'X-Tenant': required"));
    }

    #[test]
    fn optional_members_are_omitted() {
        let json = ProblemDetails::new(404, "route-not-found", "Not Found").to_json();
        assert_eq!(
            json,
            r#"{"type":"urn:portcullis:error:route-not-found","title":"Not Found","status":404}"#
        );
    }
}
