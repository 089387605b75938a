//! HTTP passthrough integration.

use super::{BackendError, IntegrationError, InvocationContext};
use crate::request::{InboundRequest, OutboundResponse};

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "host",
    "content-length",
];

const FORWARDED_FOR: &str = "x-forwarded-for";

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// The client's `x-forwarded-for` chain with the peer appended, as one value.
fn forwarded_for(request: &InboundRequest) -> Option<String> {
    let peer = request.peer_ip.map(|ip| ip.to_string());
    let chain = request
        .header(FORWARDED_FOR)
        .map(str::trim)
        .filter(|chain| !chain.is_empty());
    match (chain, peer) {
        (Some(chain), Some(peer)) => Some(format!("{}, {}", chain, peer)),
        (Some(chain), None) => Some(chain.to_string()),
        (None, peer) => peer,
    }
}

fn encode_param(name: &str, value: &str, greedy: bool) -> Result<String, IntegrationError> {
    let segments: Vec<&str> = if greedy { value.split('/').collect() } else { vec![value] };
    let mut encoded = Vec::with_capacity(segments.len());
    for segment in segments {
        let decoded = percent_decode(segment);
        if decoded == b"." || decoded == b".." {
            return Err(IntegrationError::InvalidPath(format!(
                "path parameter '{}' contains a dot segment",
                name
            )));
        }
        encoded.push(percent_encode(&decoded));
    }
    Ok(encoded.join("/"))
}

fn percent_decode(segment: &str) -> Vec<u8> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(byte) = bytes
                .get(i + 1..i + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'!' | b'$' | b'&' | b'\''
            | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=' | b':' | b'@' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct HttpProxy {
    /// Upstream URL; `{name}` and `{name+}` take path parameter values.
    url: String,
}

impl HttpProxy {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve the upstream URL for a request.
    ///
    /// Parameter values are decoded and re-encoded segment by segment, so
    /// they can never add path structure. A greedy value keeps its `/`
    /// separators. Dot segments are refused in either spelling.
    pub fn target_url(&self, ctx: &InvocationContext<'_>) -> Result<String, IntegrationError> {
        let mut url = self.url.clone();
        for (name, value) in ctx.path_params {
            let greedy = format!("{{{}+}}", name);
            if url.contains(&greedy) {
                url = url.replace(&greedy, &encode_param(name, value, true)?);
            }
            let single = format!("{{{}}}", name);
            if url.contains(&single) {
                url = url.replace(&single, &encode_param(name, value, false)?);
            }
        }
        if let Some(query) = ctx.request.raw_query.as_deref().filter(|q| !q.is_empty()) {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(query);
        }
        Ok(url)
    }

    pub async fn forward(&self, client: &reqwest::Client, ctx: &InvocationContext<'_>) -> Result<OutboundResponse, IntegrationError> {
        let request = ctx.request;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| IntegrationError::TransformFailed(format!("invalid method: {}", e)))?;

        let mut upstream = client.request(method, self.target_url(ctx)?);
        for (name, value) in &request.headers {
            let consumed = ctx
                .credential_header
                .is_some_and(|header| name.eq_ignore_ascii_case(header));
            if !is_hop_by_hop(name) && !consumed && !name.eq_ignore_ascii_case(FORWARDED_FOR) {
                upstream = upstream.header(name.as_str(), value.as_str());
            }
        }
        if let Some(chain) = forwarded_for(request) {
            upstream = upstream.header(FORWARDED_FOR, chain);
        }
        if !request.body.is_empty() {
            upstream = upstream.body(request.body.clone());
        }

        let response = upstream.send().await.map_err(BackendError::from_send)?;

        let mut relayed = OutboundResponse::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                relayed = relayed.with_header(name.as_str(), value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(BackendError::from_send)?;
        Ok(relayed.with_body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthContext;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn forwards_request_and_relays_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/pets/7"))
            .and(query_param("dry", "1"))
            .and(header("x-tenant", "acme"))
            .and(body_string(r#"{"name":"rex"}"#))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("accepted"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let proxy = HttpProxy::new(format!("{}/v1/pets/{{id}}", server.uri()));
        let request = InboundRequest::new("PUT", "/pets/7?dry=1")
            .with_header("X-Tenant", "acme")
            .with_header("Connection", "keep-alive")
            .with_body(r#"{"name":"rex"}"#);
        let params = BTreeMap::from([("id".to_string(), "7".to_string())]);
        let auth = AuthContext::default();
        let ctx = InvocationContext {
            request: &request,
            stage: "prod",
            resource: "/pets/{id}",
            path_params: &params,
            auth: &auth,
            credential_header: None,
        };

        let response = proxy.forward(&reqwest::Client::new(), &ctx).await.unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.header("x-upstream"), Some("yes"));
        assert_eq!(&response.body[..], b"accepted");
    }

    fn resolve(template: &str, param: &str, value: &str) -> Result<String, IntegrationError> {
        let proxy = HttpProxy::new(template);
        let request = InboundRequest::new("GET", "/");
        let params = BTreeMap::from([(param.to_string(), value.to_string())]);
        let auth = AuthContext::default();
        let ctx = InvocationContext {
            request: &request,
            stage: "prod",
            resource: "/files/{proxy+}",
            path_params: &params,
            auth: &auth,
            credential_header: None,
        };
        proxy.target_url(&ctx)
    }

    #[test]
    fn greedy_parameters_are_substituted() {
        assert_eq!(
            resolve("http://files.internal/{proxy+}", "proxy", "a/b/c.txt").unwrap(),
            "http://files.internal/a/b/c.txt"
        );
        assert_eq!(
            resolve("http://files.internal/{proxy+}", "proxy", "q%201/x y").unwrap(),
            "http://files.internal/q%201/x%20y"
        );
    }

    #[test]
    fn single_parameters_cannot_add_segments() {
        assert_eq!(
            resolve("http://pets.internal/pets/{id}", "id", "a%2Fb").unwrap(),
            "http://pets.internal/pets/a%2Fb"
        );
        assert_eq!(
            resolve("http://pets.internal/pets/{id}?x=1", "id", "7?admin=1").unwrap(),
            "http://pets.internal/pets/7%3Fadmin=1?x=1"
        );
    }

    #[test]
    fn dot_segments_are_rejected() {
        for value in ["../admin/secret", "a/./b", "%2e%2e/admin", "%2E%2E/admin", ".%2E/admin", "a/.."] {
            let result = resolve("http://files.internal/public/{proxy+}", "proxy", value);
            assert!(matches!(result, Err(IntegrationError::InvalidPath(_))), "{}: {:?}", value, result);
        }
        assert!(matches!(
            resolve("http://pets.internal/pets/{id}", "id", ".."),
            Err(IntegrationError::InvalidPath(_))
        ));
        assert!(resolve("http://files.internal/{proxy+}", "proxy", "v1.2/..data").is_ok());
    }

    #[tokio::test]
    async fn consumed_credential_is_stripped_and_forwarded_for_merged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let proxy = HttpProxy::new(format!("{}/items", server.uri()));
        let request = InboundRequest::new("GET", "/items")
            .with_peer_ip("10.0.0.9".parse().unwrap())
            .with_header("x-api-key", "k-secret")
            .with_header("authorization", "Bearer upstream-token")
            .with_header("x-forwarded-for", "203.0.113.7");
        let params = BTreeMap::new();
        let auth = AuthContext::default();
        let ctx = InvocationContext {
            request: &request,
            stage: "prod",
            resource: "/items",
            path_params: &params,
            auth: &auth,
            credential_header: Some("x-api-key"),
        };
        proxy.forward(&reqwest::Client::new(), &ctx).await.unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let headers = &received[0].headers;
        assert!(headers.get("x-api-key").is_none());
        assert_eq!(headers.get("authorization").unwrap(), "Bearer upstream-token");
        let forwarded: Vec<_> = headers.get_all("x-forwarded-for").iter().collect();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0], "203.0.113.7, 10.0.0.9");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_unavailable() {
        let proxy = HttpProxy::new("http://127.0.0.1:9/");
        let request = InboundRequest::new("GET", "/");
        let params = BTreeMap::new();
        let auth = AuthContext::default();
        let ctx = InvocationContext {
            request: &request,
            stage: "prod",
            resource: "/",
            path_params: &params,
            auth: &auth,
            credential_header: None,
        };
        let result = proxy.forward(&reqwest::Client::new(), &ctx).await;
        assert!(matches!(result, Err(IntegrationError::Backend(BackendError::Unavailable(_)))));
    }

    #[test]
    fn hop_by_hop_filter() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("x-api-key"));
    }
}
