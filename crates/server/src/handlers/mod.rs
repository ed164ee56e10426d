//! HTTP request handlers.

pub mod admin;
pub mod auth;
pub mod policies;
pub mod registry;

pub use admin::*;
pub use auth::*;
pub use policies::*;
pub use registry::*;
