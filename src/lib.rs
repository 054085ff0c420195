//! # llm-relay
//!
//! A multi-provider LLM request broker with credential failover.
//!
//! Clients submit a provider-neutral chat request; the relay routes it to
//! a provider adapter, picks one of that provider's configured credentials
//! (API keys or OAuth credential sets), sends the request, and surfaces a
//! neutral response or stream. Transient failures retry against other
//! credentials with per-credential exponential backoff.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP (axum)          Credential engine                 Providers
//! ┌────────────┐   ┌──────────────────────────┐   ┌──────────────────────┐
//! │ /v1/chat/… │──▶│ AuthDispatcher           │──▶│ AnthropicAdapter     │
//! │ /api/…     │   │   ├─ OAuthBag (refresh)  │   │ OpenAIAdapter        │
//! └────────────┘   │   └─ KeyBag  (rotation)  │   │ GoogleAdapter        │
//!                  │ ConnectivityCache        │   └──────────────────────┘
//!                  └──────────────────────────┘
//! ```
//!
//! ## Modules
//! - `auth`: health records, credential bags, auth dispatcher
//! - `providers`: wire-format adapters and token refresh endpoints
//! - `broker`: per-provider assembly and model routing
//! - `connectivity`: TTL cache for reachability probes
//! - `api`: HTTP frontend

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod providers;
pub mod types;

pub use broker::{Relay, RelayError};
pub use config::Config;
pub use context::{AuthKind, RequestContext};
pub use error::{AuthError, ProviderError, ProviderErrorKind};
