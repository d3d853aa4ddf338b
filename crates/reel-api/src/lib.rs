//! Axum HTTP API for ReelPipe.
//!
//! This crate provides:
//! - Presigned multipart upload plans for authenticated callers
//! - Job submission, provider webhooks and manual reconciliation
//! - Bearer token verification (Firebase ID tokens or an HS256 secret)
//! - Rate limiting, security headers and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use auth::{AuthUser, TokenVerifier};
pub use config::{ApiConfig, StoreBackend};
pub use error::{ApiError, ApiResult};
pub use routes::{create_router, WEBHOOK_ROUTE};
pub use state::AppState;
