//! HTTP API for the relay.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - Provider-neutral chat completion
//!   (unary JSON, or SSE when `stream: true`)
//! - `GET /api/providers` - Auth status per provider
//! - `GET /api/providers/{id}/health` - Reachability probe
//!   (`?bypass=true` skips the cache)
//! - `GET /api/cache/stats` - Connectivity cache statistics
//! - `POST /api/cache/clear` - Drop cached probe outcomes
//!   (`?provider=id` for one provider)
//! - `GET /api/health` - Liveness check

mod chat;
mod routes;
mod status;

pub use routes::{router, serve, AppState};
