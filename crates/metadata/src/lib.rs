//! Metadata store for the vreg virtual registry.
//!
//! This crate owns the control-plane data model:
//! - Virtual registries and their ordered upstreams
//! - Cache entries and their soft-delete lifecycle
//! - Per-group cleanup policies and run bookkeeping
//! - Local project package files
//! - Tokens, audit events, and coordination leases

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use vreg_core::config::MetadataConfig;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
