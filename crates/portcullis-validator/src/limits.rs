//! Request size limits, checked before routing.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("request body too large: {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("too many headers: {count} exceeds limit of {limit}")]
    TooManyHeaders { count: usize, limit: usize },

    #[error("URI too long: {length} characters exceeds limit of {limit}")]
    UriTooLong { length: usize, limit: usize },

    #[error("header '{name}' too large: {size} bytes exceeds limit of {limit} bytes")]
    HeaderTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },
}

/// Request limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    /// Maximum request body size in bytes (default: 10MB).
    pub max_body_size: usize,
    /// Maximum number of headers (default: 100).
    pub max_headers: usize,
    /// Maximum header size in bytes (default: 8KB).
    pub max_header_size: usize,
    /// Maximum URI length in characters (default: 8KB).
    pub max_uri_length: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024, // 10 MB
            max_headers: 100,
            max_header_size: 8 * 1024, // 8 KB
            max_uri_length: 8 * 1024,  // 8 KB
        }
    }
}

impl RequestLimits {
    /// Validate URI length.
    pub fn validate_uri(&self, uri: &str) -> Result<(), LimitViolation> {
        if uri.len() > self.max_uri_length {
            return Err(LimitViolation::UriTooLong {
                length: uri.len(),
                limit: self.max_uri_length,
            });
        }
        Ok(())
    }

    /// Validate header count and individual header sizes.
    pub fn validate_headers(&self, headers: &BTreeMap<String, String>) -> Result<(), LimitViolation> {
        if headers.len() > self.max_headers {
            return Err(LimitViolation::TooManyHeaders {
                count: headers.len(),
                limit: self.max_headers,
            });
        }

        for (name, value) in headers {
            let header_size = name.len() + value.len();
            if header_size > self.max_header_size {
                return Err(LimitViolation::HeaderTooLarge {
                    name: name.clone(),
                    size: header_size,
                    limit: self.max_header_size,
                });
            }
        }

        Ok(())
    }

    /// Validate body size.
    pub fn validate_body_size(&self, body_len: usize) -> Result<(), LimitViolation> {
        if body_len > self.max_body_size {
            return Err(LimitViolation::BodyTooLarge {
                size: body_len,
                limit: self.max_body_size,
            });
        }
        Ok(())
    }

    /// Validate all limits at once. Returns errors for all limit violations.
    pub fn validate_all(
        &self,
        uri: &str,
        headers: &BTreeMap<String, String>,
        body_len: usize,
    ) -> Result<(), Vec<LimitViolation>> {
        let errors: Vec<LimitViolation> = [
            self.validate_uri(uri),
            self.validate_headers(headers),
            self.validate_body_size(body_len),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
