//! HTTP/1.1 server edge.
//!
//! Converts hyper requests into [`InboundRequest`] values, runs them
//! through the [`Gateway`] and writes the [`OutboundResponse`] back.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use portcullis_telemetry::{log_listening, log_shutdown};
use portcullis_validator::LimitViolation;
use tokio::net::TcpListener;

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::request::{InboundRequest, OutboundResponse};

/// How long in-flight connections get to finish after shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept connections until `shutdown` resolves, then drain.
pub async fn serve(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    log_listening!(address = %addr, stage = %gateway.settings().stage, "gateway listening");

    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let metrics = Arc::clone(gateway.metrics());
        let service_gateway = Arc::clone(&gateway);
        let service = service_fn(move |req| {
            let gateway = Arc::clone(&service_gateway);
            async move { Ok::<_, Infallible>(handle(&gateway, req, peer).await) }
        });

        let connection = graceful.watch(http1::Builder::new().serve_connection(TokioIo::new(stream), service));
        metrics.connection_opened();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(peer = %peer, error = %e, "connection error");
            }
            metrics.connection_closed();
        });
    }

    log_shutdown!(reason = "signal", "shutting down, draining connections");
    tokio::select! {
        _ = graceful.shutdown() => log_shutdown!(reason = "drained", "all connections closed"),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
            tracing::warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "drain timed out");
        }
    }
    Ok(())
}

async fn handle(gateway: &Gateway, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
    let dev_mode = gateway.settings().dev_mode;
    let response = match read_request(gateway, req, peer).await {
        Ok(request) => gateway.handle(request).await,
        Err(error) => error.into_response(dev_mode),
    };
    into_hyper(response)
}

/// Buffer the body under the configured size limit and build the
/// transport-agnostic request.
async fn read_request(gateway: &Gateway, req: Request<Incoming>, peer: SocketAddr) -> Result<InboundRequest, GatewayError> {
    let limit = gateway.settings().limits.max_body_size;
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = InboundRequest::new(parts.method.as_str(), path_and_query).with_peer_ip(peer.ip());

    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(value) => request = request.with_header(name.as_str(), value),
            Err(_) => return Err(GatewayError::BadRequest(format!("header '{}' is not valid ASCII", name))),
        }
    }
    if let Some(id) = request
        .header("x-request-id")
        .filter(|id| !id.is_empty() && id.len() <= 128)
    {
        let id = id.to_string();
        request = request.with_request_id(id);
    }

    if let Some(declared) = request
        .header("content-length")
        .and_then(|len| len.parse::<usize>().ok())
    {
        if declared > limit {
            return Err(GatewayError::LimitsExceeded(vec![LimitViolation::BodyTooLarge {
                size: declared,
                limit,
            }]));
        }
    }

    Ok(request.with_body(read_body(body, limit).await?))
}

/// Collect a body, stopping as soon as it grows past `limit`. A body that
/// overruns the limit while streaming is reported like one that declared
/// its oversize up front.
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, GatewayError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(GatewayError::LimitsExceeded(vec![LimitViolation::BodyTooLarge {
                size: limit.saturating_add(1),
                limit,
            }]))
        }
        Err(e) => Err(GatewayError::BadRequest(format!("failed to read request body: {}", e))),
    }
}

fn into_hyper(response: OutboundResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(response.body)).unwrap_or_else(|e| {
        tracing::error!(error = %e, "response could not be encoded");
        let mut fallback = Response::new(Full::new(Bytes::new()));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}
