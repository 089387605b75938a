//! Transport-agnostic request and response values.
//!
//! The HTTP server converts hyper types into these at the edge; every
//! pipeline stage reads an `&InboundRequest` and produces new
//! `OutboundResponse` values rather than editing shared ones.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;
use portcullis_validator::ProblemDetails;
use serde_json::Value;
use uuid::Uuid;

/// An inbound client request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Upper-case method.
    pub method: String,
    /// Raw request path, still percent-encoded.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub raw_query: Option<String>,
    /// Decoded query pairs in arrival order.
    pub query: Vec<(String, String)>,
    /// Lowercase header names. Repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    /// Peer address of the TCP connection, if known.
    pub peer_ip: Option<IpAddr>,
    pub request_id: String,
}

impl InboundRequest {
    /// Build a request from a method and a path with optional query string.
    pub fn new(method: &str, path_and_query: &str) -> Self {
        let (path, raw_query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let query = raw_query
            .as_deref()
            .map(|q| {
                form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            method: method.to_ascii_uppercase(),
            path,
            raw_query,
            query,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            peer_ip: None,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.headers.get_mut(&name) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => {
                self.headers.insert(name, value);
            }
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_peer_ip(mut self, ip: IpAddr) -> Self {
        self.peer_ip = Some(ip);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Path plus query, as it appeared on the request line.
    pub fn uri(&self) -> String {
        match &self.raw_query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Client address: first `x-forwarded-for` hop, then the peer address.
    pub fn client_ip(&self) -> Option<String> {
        self.header("x-forwarded-for")
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_string)
            .or_else(|| self.peer_ip.map(|ip| ip.to_string()))
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
    }
}

/// A response produced by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    /// Lowercase header names.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl OutboundResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    pub fn problem(problem: &ProblemDetails) -> Self {
        Self::new(problem.status)
            .with_header("content-type", "application/problem+json")
            .with_body(problem.to_json())
    }

    /// Set a header, replacing any previous value.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
