mod gcs;
mod local;

pub use gcs::GcsStore;
pub use local::LocalStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Suffix of the sidecar that holds a blob's metadata, next to the content itself.
pub const METADATA_SUFFIX: &str = ".meta.json";

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Type alias for a boxed async reader.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid blob id: {0}")]
    InvalidId(String),
    #[error("Blob already exists: {0}")]
    AlreadyExists(String),
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Metadata kept by the blob store for every stored payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A blob read back in full.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub metadata: BlobMetadata,
    pub content: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub name: String,
    /// Guessed from the name's extension when absent
    pub mime_type: Option<String>,
    /// A fresh UUIDv4 is assigned when absent
    pub id: Option<String>,
}

impl StoreOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Exact MIME type match
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListResult {
    pub files: Vec<BlobMetadata>,
    pub total: u64,
    pub has_more: bool,
}

/// Abstraction over blob storage backends.
///
/// Every blob is two artifacts: the content and its metadata. Content is always
/// persisted first and metadata last, so the presence of metadata means the content
/// is retrievable. Reads of unknown ids yield `None`/`false`, never an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Blobs are immutable: an id that is already taken fails with `AlreadyExists`.
    async fn store(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<BlobMetadata, BlobStoreError>;

    /// Store from an async reader. The reader is drained into memory first.
    async fn store_stream(
        &self,
        mut reader: BoxReader,
        options: StoreOptions,
    ) -> Result<BlobMetadata, BlobStoreError> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.store(Bytes::from(buf), options).await
    }

    async fn get(&self, id: &str) -> Result<Option<StoredFile>, BlobStoreError>;

    /// Content only. The caller owns the reader and must drain or drop it.
    async fn get_stream(&self, id: &str) -> Result<Option<BoxReader>, BlobStoreError>;

    async fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>, BlobStoreError>;

    async fn exists(&self, id: &str) -> Result<bool, BlobStoreError>;

    /// Returns `true` if anything was removed, `false` if the id was already absent.
    async fn delete(&self, id: &str) -> Result<bool, BlobStoreError>;

    /// Newest first by `created_at`.
    async fn list(&self, options: ListOptions) -> Result<ListResult, BlobStoreError>;

    async fn count(&self) -> Result<u64, BlobStoreError>;
}

/// Build metadata for a new blob, assigning an id and MIME type where missing.
pub(crate) fn new_metadata(
    options: StoreOptions,
    size: u64,
) -> Result<BlobMetadata, BlobStoreError> {
    let id = match options.id {
        Some(id) => {
            validate_id(&id)?;
            id
        }
        None => uuid::Uuid::new_v4().to_string(),
    };

    let mime_type = options
        .mime_type
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| guess_mime_type(&options.name));

    let now = Utc::now();
    Ok(BlobMetadata {
        id,
        name: options.name,
        size,
        mime_type,
        created_at: now,
        updated_at: now,
    })
}

/// MIME type from a filename extension, or `application/octet-stream`.
pub fn guess_mime_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
}

/// Reject ids that could escape the storage namespace or collide with a sidecar.
///
/// Leading dots are reserved for backend bookkeeping such as the local `.tmp` dir.
pub(crate) fn validate_id(id: &str) -> Result<(), BlobStoreError> {
    let invalid = id.is_empty()
        || id.starts_with('.')
        || id.contains("..")
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
        || id.ends_with(METADATA_SUFFIX);

    if invalid {
        return Err(BlobStoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Filter, sort newest-first and paginate a full metadata listing.
pub(crate) fn paginate(mut files: Vec<BlobMetadata>, options: &ListOptions) -> ListResult {
    if let Some(ref mime_type) = options.mime_type {
        files.retain(|f| &f.mime_type == mime_type);
    }
    files.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let total = files.len();
    let offset = options.offset.unwrap_or(0);
    let limit = options.limit.unwrap_or(usize::MAX);

    let page: Vec<BlobMetadata> = files.into_iter().skip(offset).take(limit).collect();

    ListResult {
        files: page,
        total: total as u64,
        has_more: offset.saturating_add(limit) < total,
    }
}
