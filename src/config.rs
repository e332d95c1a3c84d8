use thiserror::Error;

/// Upper bound for `ORPHAN_GRACE_SECONDS`: ten years.
pub const MAX_ORPHAN_GRACE_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    /// Enables admin routes like the orphan sweep. Must never be true in production.
    pub test_mode: bool,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
    /// Unreferenced blobs younger than this are left alone by the orphan sweep
    pub orphan_grace_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Directory holding the entity record database
    pub data_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Gcs,
    Local,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for local storage backend
    pub local_storage_path: String,
    /// GCS bucket name (required when backend is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to the metadata server)
    pub gcs_credentials_file: Option<String>,
    /// Alternate GCS endpoint such as an emulator. Requests are sent unauthenticated.
    pub gcs_endpoint: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_storage_path: "./files".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
            gcs_endpoint: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            test_mode: false,
            max_upload_size: 50 * 1024 * 1024, // 50MB
            orphan_grace_seconds: 3600,
        }
    }
}

impl Config {
    /// Grace period of the orphan sweep, capped at [`MAX_ORPHAN_GRACE_SECONDS`].
    pub fn orphan_grace(&self) -> chrono::Duration {
        let seconds = self.orphan_grace_seconds.min(MAX_ORPHAN_GRACE_SECONDS);
        chrono::Duration::seconds(seconds as i64)
    }

    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let bind_address = lookup("BIND_ADDRESS").unwrap_or(defaults.server.bind_address);
        let data_dir = lookup("DATA_DIR").unwrap_or(defaults.server.data_dir);

        let test_mode = lookup("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size = lookup("MAX_UPLOAD_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_upload_size);

        let orphan_grace_seconds = lookup("ORPHAN_GRACE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.orphan_grace_seconds);

        let backend = match lookup("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => StorageBackend::Gcs,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "STORAGE_BACKEND must be 'local' or 'gcs', got '{other}'"
                )))
            }
        };

        let local_storage_path =
            lookup("LOCAL_STORAGE_PATH").unwrap_or(defaults.storage.local_storage_path);

        let config = Config {
            server: ServerConfig {
                bind_address,
                data_dir,
            },
            storage: StorageConfig {
                backend,
                local_storage_path,
                gcs_bucket: lookup("GCS_BUCKET"),
                gcs_credentials_file: lookup("GCS_CREDENTIALS_FILE"),
                gcs_endpoint: lookup("GCS_ENDPOINT"),
            },
            test_mode,
            max_upload_size,
            orphan_grace_seconds,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_UPLOAD_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.orphan_grace_seconds > MAX_ORPHAN_GRACE_SECONDS {
            return Err(ConfigError::ValidationError(format!(
                "ORPHAN_GRACE_SECONDS must be at most {MAX_ORPHAN_GRACE_SECONDS}"
            )));
        }

        if self.storage.backend == StorageBackend::Gcs && self.storage.gcs_bucket.is_none() {
            return Err(ConfigError::ValidationError(
                "GCS_BUCKET is required when STORAGE_BACKEND=gcs".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Local
            && self.storage.local_storage_path.trim().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "LOCAL_STORAGE_PATH cannot be empty".to_string(),
            ));
        }

        if self.test_mode {
            tracing::warn!("TEST_MODE is enabled. Admin routes are exposed.");
        }

        Ok(())
    }
}
