use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{
    new_metadata, paginate, validate_id, BlobMetadata, BlobStore, BlobStoreError, BoxReader,
    ListOptions, ListResult, StoreOptions, StoredFile, METADATA_SUFFIX,
};

/// Local filesystem blob store.
///
/// Layout: `{base_path}/{id}` holds the content and `{base_path}/{id}.meta.json` the
/// metadata. Both are written to `{base_path}/.tmp` first and hard-linked into place, so an
/// existing blob is never overwritten.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(base_path.join(".tmp"))?;
        Ok(Self { base_path })
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.base_path.join(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{id}{METADATA_SUFFIX}"))
    }

    fn temp_path(&self) -> PathBuf {
        self.base_path
            .join(".tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Write `data` to a temp file and link it into place. Never replaces `target`.
    async fn write_new(&self, target: &Path, id: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        let temp_path = self.temp_path();
        if let Err(e) = fs::write(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        let linked = fs::hard_link(&temp_path, target).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BlobStoreError::AlreadyExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_metadata(&self, path: &Path) -> Result<Option<BlobMetadata>, BlobStoreError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_if_present(path: &Path) -> Result<bool, BlobStoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata_paths(&self) -> Result<Vec<PathBuf>, BlobStoreError> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_metadata = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(METADATA_SUFFIX));
            if is_metadata {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn store(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<BlobMetadata, BlobStoreError> {
        let metadata = new_metadata(options, content.len() as u64)?;

        // Content first: metadata on disk implies the content is already there.
        self.write_new(&self.content_path(&metadata.id), &metadata.id, &content)
            .await?;

        let sidecar = serde_json::to_vec_pretty(&metadata)?;
        if let Err(e) = self
            .write_new(&self.metadata_path(&metadata.id), &metadata.id, &sidecar)
            .await
        {
            // Only the content linked above is removed; an existing sidecar stays.
            let _ = fs::remove_file(self.content_path(&metadata.id)).await;
            return Err(e);
        }

        tracing::debug!(file_id = %metadata.id, size = metadata.size, "Stored blob");
        Ok(metadata)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredFile>, BlobStoreError> {
        validate_id(id)?;
        let Some(metadata) = self.read_metadata(&self.metadata_path(id)).await? else {
            return Ok(None);
        };

        match fs::read(self.content_path(id)).await {
            Ok(data) => Ok(Some(StoredFile {
                metadata,
                content: Bytes::from(data),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_stream(&self, id: &str) -> Result<Option<BoxReader>, BlobStoreError> {
        validate_id(id)?;
        let file = match fs::File::open(self.content_path(id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Ok(None);
        }
        Ok(Some(Box::new(tokio::io::BufReader::new(file))))
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>, BlobStoreError> {
        validate_id(id)?;
        self.read_metadata(&self.metadata_path(id)).await
    }

    async fn exists(&self, id: &str) -> Result<bool, BlobStoreError> {
        validate_id(id)?;
        Ok(fs::try_exists(self.metadata_path(id)).await?)
    }

    async fn delete(&self, id: &str) -> Result<bool, BlobStoreError> {
        validate_id(id)?;
        // Metadata goes first so a half-finished delete never advertises missing content.
        let had_metadata = Self::remove_if_present(&self.metadata_path(id)).await?;
        let had_content = Self::remove_if_present(&self.content_path(id)).await?;

        if had_metadata || had_content {
            tracing::debug!(file_id = %id, "Deleted blob");
        }
        Ok(had_metadata || had_content)
    }

    async fn list(&self, options: ListOptions) -> Result<ListResult, BlobStoreError> {
        let mut files = Vec::new();
        for path in self.metadata_paths().await? {
            // A sidecar can vanish between read_dir and read under concurrent deletes.
            if let Some(metadata) = self.read_metadata(&path).await? {
                files.push(metadata);
            }
        }
        Ok(paginate(files, &options))
    }

    async fn count(&self) -> Result<u64, BlobStoreError> {
        Ok(self.metadata_paths().await?.len() as u64)
    }
}
