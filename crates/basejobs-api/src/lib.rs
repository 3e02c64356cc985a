//! Axum HTTP/WS API server.
//!
//! This crate provides:
//! - Job enqueue, status and log endpoints
//! - The live status gateway and its WebSocket endpoint
//! - Health probes and Prometheus metrics

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use gateway::LiveGateway;
pub use routes::create_router;
pub use state::AppState;
