//! Backend compute collaborators.
//!
//! A backend takes a JSON event and returns a JSON result. The gateway
//! never assumes anything about where the function runs.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// The function could not be reached. The only retryable failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call was sent but no answer arrived in time. The function may
    /// still have run, so this is never retried.
    #[error("backend timed out: {0}")]
    TimedOut(String),

    #[error("backend returned HTTP {status}")]
    Status { status: u16, body: String },

    #[error("backend returned an invalid payload: {0}")]
    InvalidPayload(String),

    /// The function ran and reported an error of its own.
    #[error("function error: {message}")]
    Function {
        message: String,
        error_type: Option<String>,
    },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    /// Classify a transport error from `reqwest`.
    pub fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::TimedOut(e.to_string())
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Unavailable(_) => "unavailable",
            BackendError::TimedOut(_) => "timed_out",
            BackendError::Status { .. } => "status",
            BackendError::InvalidPayload(_) => "invalid_payload",
            BackendError::Function { .. } => "function_error",
        }
    }
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, payload: Value) -> BoxFuture<'_, Result<Value, BackendError>>;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

/// Recognize a function error payload: an object carrying `errorMessage`
/// and nothing besides `errorType`/`stackTrace`.
pub fn function_error(value: &Value) -> Option<BackendError> {
    let object = value.as_object()?;
    let message = object.get("errorMessage")?.as_str()?;
    if object
        .keys()
        .any(|k| !matches!(k.as_str(), "errorMessage" | "errorType" | "stackTrace"))
    {
        return None;
    }
    Some(BackendError::Function {
        message: message.to_string(),
        error_type: object
            .get("errorType")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Invokes a function through its HTTPS URL with a JSON POST.
pub struct HttpFunctionBackend {
    name: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpFunctionBackend {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout,
            client,
        }
    }

    async fn call(&self, payload: Value) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(BackendError::from_send)?;

        let status = response.status();
        let body = response.bytes().await.map_err(BackendError::from_send)?;

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::Unavailable(format!("HTTP {}", status.as_u16())));
        }

        let value: Option<Value> = serde_json::from_slice(&body).ok();
        if let Some(error) = value.as_ref().and_then(function_error) {
            return Err(error);
        }

        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        value.ok_or_else(|| BackendError::InvalidPayload("response body is not JSON".into()))
    }
}

impl Backend for HttpFunctionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, payload: Value) -> BoxFuture<'_, Result<Value, BackendError>> {
        self.call(payload).boxed()
    }
}

/// Adapts an async closure into a backend, for embedding and tests.
pub struct FnBackend<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnBackend<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F, Fut> Backend for FnBackend<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, payload: Value) -> BoxFuture<'_, Result<Value, BackendError>> {
        (self.f)(payload).boxed()
    }
}
