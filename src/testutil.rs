//! Shared test helpers for HTTP handler tests.

use std::sync::Arc;

use crate::blob_store::LocalStore;
use crate::config::{Config, ServerConfig, StorageConfig};
use crate::storage::Database;
use crate::AppState;

/// Create a test AppState with a temporary database and local blob store.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

    let config = Config {
        server: ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        storage: StorageConfig {
            local_storage_path: files_dir.to_string_lossy().to_string(),
            ..Default::default()
        },
        test_mode: true,
        max_upload_size: 1024 * 1024, // 1MB for tests
        orphan_grace_seconds: 0,
    };

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let blob_store = LocalStore::new(&files_dir).expect("Failed to create test blob store");

    Arc::new(AppState::new(config, db, Arc::new(blob_store)))
}
