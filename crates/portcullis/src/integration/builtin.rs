//! In-process functions, useful for demos and smoke tests.

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::backend::{Backend, BackendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinFunction {
    /// Proxy-style greeter: reads `queryStringParameters.name` from the
    /// event and answers with a full proxy response.
    HelloProxy,
    /// Transform-style greeter: reads `name` from the mapped payload.
    HelloTransform,
    /// Returns its input unchanged.
    Echo,
}

pub struct BuiltinBackend {
    name: String,
    function: BuiltinFunction,
}

impl BuiltinBackend {
    pub fn new(name: impl Into<String>, function: BuiltinFunction) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }
}

impl Backend for BuiltinBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, payload: Value) -> BoxFuture<'_, Result<Value, BackendError>> {
        let result = match self.function {
            BuiltinFunction::HelloProxy => hello_proxy(&payload),
            BuiltinFunction::HelloTransform => hello_transform(&payload),
            BuiltinFunction::Echo => payload,
        };
        future::ready(Ok(result)).boxed()
    }
}

fn hello_proxy(event: &Value) -> Value {
    let name = event
        .pointer("/queryStringParameters/name")
        .and_then(Value::as_str)
        .unwrap_or("World");

    let body = json!({
        "message": format!("Hello, {}! Your request was successful.", name),
        "status": "success",
    });

    json!({
        "statusCode": 200,
        "headers": { "Content-Type": "application/json" },
        "body": body.to_string(),
    })
}

fn hello_transform(payload: &Value) -> Value {
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("World");
    json!({ "greeting": format!("Hello from non-proxy, {}!", name) })
}
