//! Keeps entity records and the blob store consistent.
//!
//! Every mutation follows the same order: new content is stored before any record
//! points at it, and a blob is deleted only after the record stopped pointing at it.
//! A failure part-way leaves an unreferenced blob (an orphan) but never a record
//! that references a missing blob. Orphans are reclaimed by [`FileLifecycle::sweep_orphans`].

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blob_store::{BlobStore, BlobStoreError, ListOptions, StoreOptions};
use crate::storage::models::{Attachment, EntityKey, EntityKind, FileRef, ImageSlot};
use crate::storage::{DatabaseError, RecordStore};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityKey),
    #[error("{kind} entities have no {slot} image")]
    SlotNotAvailable { kind: EntityKind, slot: ImageSlot },
    #[error("{0} entities have no attachments")]
    AttachmentsNotAvailable(EntityKind),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Outcome of an orphan sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: u64,
    pub deleted: u64,
}

#[derive(Clone)]
pub struct FileLifecycle {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
}

impl FileLifecycle {
    pub fn new(blobs: Arc<dyn BlobStore>, records: Arc<dyn RecordStore>) -> Self {
        Self { blobs, records }
    }

    // ========================================================================
    // Single-slot images
    // ========================================================================

    /// Store `content` and point `slot` at it, then delete the blob it replaced.
    pub async fn replace_image(
        &self,
        key: &EntityKey,
        slot: ImageSlot,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<FileRef, LifecycleError> {
        self.require_slot(key, slot)?;

        let meta = self.blobs.store(content, options).await?;
        let file = FileRef::from(&meta);

        let previous = match self.records.replace_image(key, slot, Some(file.clone())) {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                warn!(entity = %key, file_id = %file.id, "Entity vanished before image commit, blob orphaned");
                return Err(LifecycleError::EntityNotFound(key.clone()));
            }
            Err(e) => {
                warn!(entity = %key, file_id = %file.id, error = %e, "Image commit failed, blob orphaned");
                return Err(e.into());
            }
        };

        if let Some(old) = previous.filter(|old| old.id != file.id) {
            self.blobs.delete(&old.id).await?;
            debug!(entity = %key, file_id = %old.id, "Deleted replaced image");
        }

        info!(entity = %key, slot = %slot, file_id = %file.id, "Replaced image");
        Ok(file)
    }

    /// Unset `slot` and delete the blob it held. Returns the removed reference.
    pub async fn clear_image(
        &self,
        key: &EntityKey,
        slot: ImageSlot,
    ) -> Result<Option<FileRef>, LifecycleError> {
        if !key.kind.has_image_slot(slot) {
            return Err(LifecycleError::SlotNotAvailable {
                kind: key.kind,
                slot,
            });
        }

        let previous = self
            .records
            .replace_image(key, slot, None)?
            .ok_or_else(|| LifecycleError::EntityNotFound(key.clone()))?;

        if let Some(ref old) = previous {
            self.blobs.delete(&old.id).await?;
            info!(entity = %key, slot = %slot, file_id = %old.id, "Cleared image");
        }
        Ok(previous)
    }

    // ========================================================================
    // Attachment collections
    // ========================================================================

    /// Store `content` and append it to the entity's attachments under `label`.
    pub async fn add_attachment(
        &self,
        key: &EntityKey,
        label: &str,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<Attachment, LifecycleError> {
        self.require_attachments(key)?;

        let meta = self.blobs.store(content, options).await?;
        let attachment = Attachment::new(label, FileRef::from(&meta));

        match self.records.append_attachment(key, attachment.clone()) {
            Ok(true) => {}
            Ok(false) => {
                warn!(entity = %key, file_id = %attachment.id, "Entity vanished before attachment commit, blob orphaned");
                return Err(LifecycleError::EntityNotFound(key.clone()));
            }
            Err(e) => {
                warn!(entity = %key, file_id = %attachment.id, error = %e, "Attachment commit failed, blob orphaned");
                return Err(e.into());
            }
        }

        info!(entity = %key, file_id = %attachment.id, label = %attachment.label, "Added attachment");
        Ok(attachment)
    }

    /// Drop the attachment with `attachment_id` and delete its blob.
    ///
    /// Unknown ids are a no-op and yield `None`.
    pub async fn remove_attachment(
        &self,
        key: &EntityKey,
        attachment_id: &str,
    ) -> Result<Option<Attachment>, LifecycleError> {
        if !key.kind.has_attachments() {
            return Err(LifecycleError::AttachmentsNotAvailable(key.kind));
        }

        let Some(removed) = self.records.remove_attachment(key, attachment_id)? else {
            debug!(entity = %key, attachment_id, "No attachment to remove");
            return Ok(None);
        };

        self.blobs.delete(&removed.file.id).await?;
        info!(entity = %key, file_id = %removed.id, "Removed attachment");
        Ok(Some(removed))
    }

    pub fn list_attachments(&self, key: &EntityKey) -> Result<Vec<Attachment>, LifecycleError> {
        if !key.kind.has_attachments() {
            return Err(LifecycleError::AttachmentsNotAvailable(key.kind));
        }
        let record = self
            .records
            .get_entity(key)?
            .ok_or_else(|| LifecycleError::EntityNotFound(key.clone()))?;
        Ok(record.attachments)
    }

    // ========================================================================
    // Whole entities and maintenance
    // ========================================================================

    /// Delete the record, then every blob it referenced.
    ///
    /// Returns `false` if there was no such entity. All blobs are attempted even if
    /// one delete fails; the first failure is returned.
    pub async fn delete_entity(&self, key: &EntityKey) -> Result<bool, LifecycleError> {
        let Some(record) = self.records.take_entity(key)? else {
            return Ok(false);
        };

        let mut first_error = None;
        for file_id in record.file_ids() {
            if let Err(e) = self.blobs.delete(&file_id).await {
                warn!(entity = %key, file_id = %file_id, error = %e, "Failed to delete blob of deleted entity");
                first_error.get_or_insert(e);
            }
        }

        info!(entity = %key, "Deleted entity");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(true),
        }
    }

    /// Delete blobs that no record references and that are older than `grace`.
    ///
    /// The grace period protects uploads whose reference has not been committed yet.
    pub async fn sweep_orphans(
        &self,
        grace: chrono::Duration,
    ) -> Result<SweepStats, LifecycleError> {
        let cutoff = Utc::now() - grace;
        let listing = self.blobs.list(ListOptions::default()).await?;
        let referenced = self.records.referenced_file_ids()?;

        let mut stats = SweepStats {
            scanned: listing.files.len() as u64,
            deleted: 0,
        };

        for meta in listing.files {
            if referenced.contains(&meta.id) || meta.created_at >= cutoff {
                continue;
            }
            if self.blobs.delete(&meta.id).await? {
                debug!(file_id = %meta.id, "Swept orphaned blob");
                stats.deleted += 1;
            }
        }

        info!(scanned = stats.scanned, deleted = stats.deleted, "Orphan sweep finished");
        Ok(stats)
    }

    fn require_slot(&self, key: &EntityKey, slot: ImageSlot) -> Result<(), LifecycleError> {
        if !key.kind.has_image_slot(slot) {
            return Err(LifecycleError::SlotNotAvailable {
                kind: key.kind,
                slot,
            });
        }
        self.require_entity(key)
    }

    fn require_attachments(&self, key: &EntityKey) -> Result<(), LifecycleError> {
        if !key.kind.has_attachments() {
            return Err(LifecycleError::AttachmentsNotAvailable(key.kind));
        }
        self.require_entity(key)
    }

    fn require_entity(&self, key: &EntityKey) -> Result<(), LifecycleError> {
        if !self.records.entity_exists(key)? {
            return Err(LifecycleError::EntityNotFound(key.clone()));
        }
        Ok(())
    }
}
