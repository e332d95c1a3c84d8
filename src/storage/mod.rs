pub mod db;
mod entities;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;

use std::collections::HashSet;

use models::{Attachment, EntityKey, EntityRecord, FileRef, ImageSlot};

/// The record-layer primitives the file lifecycle is built on.
///
/// Each mutating call is one transaction: it either commits entirely or leaves the
/// record untouched, and concurrent calls on the same record are serialized.
pub trait RecordStore: Send + Sync {
    fn get_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError>;

    fn entity_exists(&self, key: &EntityKey) -> Result<bool, DatabaseError>;

    /// Read the slot's current reference and overwrite it in the same transaction.
    ///
    /// Returns the previous value, or `None` if the entity does not exist.
    fn replace_image(
        &self,
        key: &EntityKey,
        slot: ImageSlot,
        file: Option<FileRef>,
    ) -> Result<Option<Option<FileRef>>, DatabaseError>;

    /// Returns `false` if the entity does not exist.
    fn append_attachment(
        &self,
        key: &EntityKey,
        attachment: Attachment,
    ) -> Result<bool, DatabaseError>;

    /// Remove the entry whose `id` matches and return it.
    fn remove_attachment(
        &self,
        key: &EntityKey,
        attachment_id: &str,
    ) -> Result<Option<Attachment>, DatabaseError>;

    /// Delete the record and return what it held.
    fn take_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError>;

    /// Every blob id referenced by any record.
    fn referenced_file_ids(&self) -> Result<HashSet<String>, DatabaseError>;
}
