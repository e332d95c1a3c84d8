//! cms-files - Blob storage and attachment lifecycle for CMS entities
//!
//! This crate keeps entity records and their binary files consistent:
//! - Swappable blob store backends (local filesystem, GCS) behind one trait
//! - redb embedded database for entity records (ACID, single-writer transactions)
//! - Image slot and attachment lifecycles that never leave dangling references
//! - REST API with multipart upload support and a raw file retrieval route

pub mod api;
pub mod blob_store;
pub mod config;
pub mod lifecycle;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use blob_store::BlobStore;
use config::Config;
use lifecycle::FileLifecycle;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub blob_store: Arc<dyn BlobStore>,
    pub lifecycle: FileLifecycle,
}

impl AppState {
    /// Wire the lifecycle to the given record database and blob store.
    pub fn new(config: Config, db: Database, blob_store: Arc<dyn BlobStore>) -> Self {
        let lifecycle = FileLifecycle::new(Arc::clone(&blob_store), Arc::new(db.clone()));
        Self {
            config,
            db,
            blob_store,
            lifecycle,
        }
    }
}
