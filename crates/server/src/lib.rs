//! Virtual registry server.
//!
//! Pull-through caching proxy for Maven and container registries:
//! - Ordered upstream resolution per virtual registry
//! - Single-flight cache fills into object storage
//! - Artifact serving with freshness re-validation
//! - Signed internal uploads
//! - Cleanup policies with a background scheduler
//! - Admin API (registries, upstreams, tokens, policies)

pub mod audit;
pub mod auth;
pub mod bootstrap;
pub mod cleanup;
pub mod error;
pub mod fill;
pub mod handlers;
pub mod ingest;
pub mod internal;
pub mod locks;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod upstream;

pub use auth::TraceId;
pub use error::ApiError;
pub use ratelimit::RateLimitState;
pub use routes::create_router;
pub use state::AppState;
