//! Schema tree for structural body validation.
//!
//! A [`ValidationModel`] is loaded once (YAML or JSON, JSON-Schema-like
//! keywords) and never mutated afterwards. Evaluation reports every
//! violation it finds across independent fields, but stops descending into
//! a field as soon as that field has the wrong JSON type.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{FieldError, FieldErrorKind, Location};

/// A node of the schema tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ValidationModel {
    Object(ObjectModel),
    Array(ArrayModel),
    String(StringModel),
    Integer(NumberModel),
    Number(NumberModel),
    Boolean {},
    Null {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectModel {
    pub properties: BTreeMap<String, ValidationModel>,
    pub required: Vec<String>,
    /// When `false`, properties not listed in `properties` are rejected.
    #[serde(default = "default_true")]
    pub additional_properties: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ArrayModel {
    pub items: Option<Box<ValidationModel>>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct StringModel {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Pattern>,
    #[serde(rename = "enum")]
    pub allowed: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct NumberModel {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: bool,
    pub exclusive_maximum: bool,
}

impl Default for ObjectModel {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A compiled regular expression constraint.
///
/// Compiled when the model is loaded so an invalid pattern fails the load,
/// not the first request.
#[derive(Clone)]
pub struct Pattern(regex_lite::Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex_lite::Error> {
        regex_lite::Regex::new(source).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

impl ValidationModel {
    /// Validate a JSON document against this model.
    ///
    /// Returns every field-level violation; an empty `Err` is never produced.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        self.check(value, String::new(), &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The JSON type name this node accepts.
    pub fn type_name(&self) -> &'static str {
        match self {
            ValidationModel::Object(_) => "object",
            ValidationModel::Array(_) => "array",
            ValidationModel::String(_) => "string",
            ValidationModel::Integer(_) => "integer",
            ValidationModel::Number(_) => "number",
            ValidationModel::Boolean {} => "boolean",
            ValidationModel::Null {} => "null",
        }
    }

    fn check(&self, value: &Value, path: String, errors: &mut Vec<FieldError>) {
        let push = |errors: &mut Vec<FieldError>, path: &str, kind| {
            errors.push(FieldError::new(Location::Body, display_path(path), kind));
        };

        match (self, value) {
            (ValidationModel::Object(model), Value::Object(map)) => {
                for name in &model.required {
                    if !map.contains_key(name) {
                        push(errors, &child_path(&path, name), FieldErrorKind::Required);
                    }
                }
                for (name, field_value) in map {
                    match model.properties.get(name) {
                        Some(field_model) => {
                            field_model.check(field_value, child_path(&path, name), errors)
                        }
                        None if !model.additional_properties => {
                            push(errors, &child_path(&path, name), FieldErrorKind::UnknownField)
                        }
                        None => {}
                    }
                }
            }
            (ValidationModel::Array(model), Value::Array(items)) => {
                if let Some(min) = model.min_items {
                    if items.len() < min {
                        push(errors, &path, FieldErrorKind::TooFewItems { min, actual: items.len() });
                    }
                }
                if let Some(max) = model.max_items {
                    if items.len() > max {
                        push(errors, &path, FieldErrorKind::TooManyItems { max, actual: items.len() });
                    }
                }
                if let Some(item_model) = &model.items {
                    for (i, item) in items.iter().enumerate() {
                        item_model.check(item, format!("{}[{}]", path, i), errors);
                    }
                }
            }
            (ValidationModel::String(model), Value::String(s)) => {
                let len = s.chars().count();
                if let Some(min) = model.min_length {
                    if len < min {
                        push(errors, &path, FieldErrorKind::TooShort { min, actual: len });
                    }
                }
                if let Some(max) = model.max_length {
                    if len > max {
                        push(errors, &path, FieldErrorKind::TooLong { max, actual: len });
                    }
                }
                if let Some(pattern) = &model.pattern {
                    if !pattern.is_match(s) {
                        push(
                            errors,
                            &path,
                            FieldErrorKind::PatternMismatch {
                                pattern: pattern.as_str().to_string(),
                            },
                        );
                    }
                }
                if let Some(allowed) = &model.allowed {
                    if !allowed.iter().any(|a| a == s) {
                        push(errors, &path, FieldErrorKind::NotAllowed { allowed: allowed.clone() });
                    }
                }
            }
            (ValidationModel::Integer(model), Value::Number(n)) if is_integer(n) => {
                model.check_bounds(n, &path, errors);
            }
            (ValidationModel::Number(model), Value::Number(n)) => {
                model.check_bounds(n, &path, errors);
            }
            (ValidationModel::Boolean {}, Value::Bool(_)) | (ValidationModel::Null {}, Value::Null) => {}
            (model, other) => push(
                errors,
                &path,
                FieldErrorKind::TypeMismatch {
                    expected: model.type_name(),
                    actual: json_type_name(other),
                },
            ),
        }
    }
}

impl NumberModel {
    fn check_bounds(&self, n: &serde_json::Number, path: &str, errors: &mut Vec<FieldError>) {
        let Some(value) = n.as_f64() else {
            return;
        };

        if let Some(min) = self.minimum {
            let below = if self.exclusive_minimum { value <= min } else { value < min };
            if below {
                errors.push(FieldError::new(
                    Location::Body,
                    display_path(path),
                    FieldErrorKind::BelowMinimum {
                        minimum: min,
                        exclusive: self.exclusive_minimum,
                    },
                ));
            }
        }
        if let Some(max) = self.maximum {
            let above = if self.exclusive_maximum { value >= max } else { value > max };
            if above {
                errors.push(FieldError::new(
                    Location::Body,
                    display_path(path),
                    FieldErrorKind::AboveMaximum {
                        maximum: max,
                        exclusive: self.exclusive_maximum,
                    },
                ));
            }
        }
    }
}

fn is_integer(n: &serde_json::Number) -> bool {
    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

/// Name of the JSON type of `value`, as used in error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if is_integer(n) => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
