//! Portcullis data plane library.
//!
//! The [`Gateway`] owns the published stages and runs every request
//! through routing, throttling, authorization, validation, caching and
//! integration. The `portcullis` binary wraps it in an HTTP server.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod integration;
pub mod request;
pub mod route;
pub mod server;
pub mod stage;
pub mod throttle;

pub use config::{Catalog, ConfigError, GatewayConfig};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewaySettings};
pub use request::{InboundRequest, OutboundResponse};
pub use route::Route;
pub use stage::{Stage, StageRegistry};
