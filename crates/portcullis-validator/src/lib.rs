//! Request validation for the Portcullis gateway.
//!
//! Validates inbound request parameters and bodies against declared models
//! before the backend is invoked. Validation is purely structural and
//! reports every field-level problem in one pass.

pub mod limits;
pub mod model;
pub mod problem;

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use limits::{LimitViolation, RequestLimits};
pub use model::{ArrayModel, NumberModel, ObjectModel, Pattern, StringModel, ValidationModel};
pub use problem::ProblemDetails;

/// Where in the request a field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Body,
    Query,
    Header,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Location::Body => "body",
            Location::Query => "query",
            Location::Header => "header",
        })
    }
}

/// A single field-level violation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{location} field '{path}': {kind}")]
pub struct FieldError {
    pub location: Location,
    /// Dotted/indexed path (`address.city`, `items[2].sku`, `$` for the root).
    pub path: String,
    pub kind: FieldErrorKind,
}

impl FieldError {
    pub fn new(location: Location, path: impl Into<String>, kind: FieldErrorKind) -> Self {
        Self {
            location,
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldErrorKind {
    #[error("required")]
    Required,

    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("length {actual} is below minimum {min}")]
    TooShort { min: usize, actual: usize },

    #[error("length {actual} exceeds maximum {max}")]
    TooLong { max: usize, actual: usize },

    #[error("does not match pattern '{pattern}'")]
    PatternMismatch { pattern: String },

    #[error("must be one of {allowed:?}")]
    NotAllowed { allowed: Vec<String> },

    #[error("below {}minimum {minimum}", exclusive_prefix(.exclusive))]
    BelowMinimum { minimum: f64, exclusive: bool },

    #[error("above {}maximum {maximum}", exclusive_prefix(.exclusive))]
    AboveMaximum { maximum: f64, exclusive: bool },

    #[error("{actual} items is below minimum {min}")]
    TooFewItems { min: usize, actual: usize },

    #[error("{actual} items exceeds maximum {max}")]
    TooManyItems { max: usize, actual: usize },

    #[error("unknown field")]
    UnknownField,

    #[error("unsupported content-type '{0}'")]
    UnsupportedContentType(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

fn exclusive_prefix(exclusive: &bool) -> &'static str {
    if *exclusive {
        "exclusive "
    } else {
        ""
    }
}

/// Declared request constraints for a route.
///
/// Loaded from gateway configuration; pure value after load.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestValidator {
    /// Body model. When set, a JSON body is required.
    pub body: Option<ValidationModel>,
    /// Query parameters that must be present.
    pub required_query: Vec<String>,
    /// Headers that must be present (case-insensitive).
    pub required_headers: Vec<String>,
}

impl RequestValidator {
    /// Validate an entire request, accumulating errors across query,
    /// headers and body.
    ///
    /// `headers` keys must be lowercase.
    pub fn validate(
        &self,
        query: &[(String, String)],
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        for name in &self.required_query {
            if !query.iter().any(|(k, _)| k == name) {
                errors.push(FieldError::new(Location::Query, name.clone(), FieldErrorKind::Required));
            }
        }

        for name in &self.required_headers {
            if !headers.contains_key(&name.to_lowercase()) {
                errors.push(FieldError::new(Location::Header, name.clone(), FieldErrorKind::Required));
            }
        }

        if let Some(model) = &self.body {
            self.validate_body(model, headers.get("content-type").map(String::as_str), body, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_body(
        &self,
        model: &ValidationModel,
        content_type: Option<&str>,
        body: &[u8],
        errors: &mut Vec<FieldError>,
    ) {
        if body.is_empty() {
            errors.push(FieldError::new(Location::Body, "$", FieldErrorKind::Required));
            return;
        }

        if let Some(ct) = content_type {
            let base_ct = ct.split(';').next().unwrap_or(ct).trim();
            if !base_ct.contains("json") {
                errors.push(FieldError::new(
                    Location::Body,
                    "$",
                    FieldErrorKind::UnsupportedContentType(base_ct.to_string()),
                ));
                return;
            }
        }

        match serde_json::from_slice::<Value>(body) {
            Ok(document) => {
                if let Err(body_errors) = model.validate(&document) {
                    errors.extend(body_errors);
                }
            }
            Err(e) => errors.push(FieldError::new(
                Location::Body,
                "$",
                FieldErrorKind::InvalidJson(e.to_string()),
            )),
        }
    }
}
