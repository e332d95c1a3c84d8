use std::collections::HashSet;

use chrono::Utc;
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{Attachment, EntityKey, EntityKind, EntityRecord, FileRef, ImageSlot};
use super::tables::*;
use super::RecordStore;

impl Database {
    // ========================================================================
    // Entity operations
    // ========================================================================

    /// Create an empty record. Returns `None` if the key is already taken.
    pub fn create_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError> {
        debug_assert!(!key.id.is_empty(), "entity id must not be empty");

        let storage_key = key.storage_key();
        let write_txn = self.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(ENTITIES)?;
            let taken = table.get(storage_key.as_str())?.is_some();
            if taken {
                None
            } else {
                let record = EntityRecord::new(key);
                let data = rmp_serde::to_vec_named(&record)?;
                table.insert(storage_key.as_str(), data.as_slice())?;
                Some(record)
            }
        };

        if created.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(created)
    }

    /// All records, optionally restricted to one kind
    pub fn list_entities(
        &self,
        kind: Option<EntityKind>,
    ) -> Result<Vec<EntityRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ENTITIES)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let record: EntityRecord = rmp_serde::from_slice(value.value())?;
            if kind.map_or(true, |k| k == record.kind) {
                records.push(record);
            }
        }

        Ok(records)
    }

    /// Read, modify and write back one record inside a single write transaction.
    ///
    /// `apply` returns its result plus whether it changed the record; unchanged
    /// records are not rewritten. Returns `None` if the record does not exist.
    fn mutate_entity<T>(
        &self,
        key: &EntityKey,
        apply: impl FnOnce(&mut EntityRecord) -> (T, bool),
    ) -> Result<Option<T>, DatabaseError> {
        let storage_key = key.storage_key();
        let write_txn = self.begin_write()?;

        let outcome = {
            let mut table = write_txn.open_table(ENTITIES)?;
            let existing: Option<EntityRecord> = match table.get(storage_key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut record) => {
                    let (result, changed) = apply(&mut record);
                    if changed {
                        record.updated_at = Utc::now();
                        let data = rmp_serde::to_vec_named(&record)?;
                        table.insert(storage_key.as_str(), data.as_slice())?;
                    }
                    Some((result, changed))
                }
                None => None,
            }
        };

        match outcome {
            Some((result, true)) => {
                write_txn.commit()?;
                Ok(Some(result))
            }
            Some((result, false)) => {
                write_txn.abort()?;
                Ok(Some(result))
            }
            None => {
                write_txn.abort()?;
                Ok(None)
            }
        }
    }
}

impl RecordStore for Database {
    fn get_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ENTITIES)?;

        match table.get(key.storage_key().as_str())? {
            Some(data) => {
                let record: EntityRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn entity_exists(&self, key: &EntityKey) -> Result<bool, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ENTITIES)?;
        Ok(table.get(key.storage_key().as_str())?.is_some())
    }

    fn replace_image(
        &self,
        key: &EntityKey,
        slot: ImageSlot,
        file: Option<FileRef>,
    ) -> Result<Option<Option<FileRef>>, DatabaseError> {
        self.mutate_entity(key, |record| {
            let current = record.images.slot_mut(slot);
            let changed = *current != file;
            (std::mem::replace(current, file), changed)
        })
    }

    fn append_attachment(
        &self,
        key: &EntityKey,
        attachment: Attachment,
    ) -> Result<bool, DatabaseError> {
        let appended = self.mutate_entity(key, |record| {
            record.attachments.push(attachment);
            ((), true)
        })?;
        Ok(appended.is_some())
    }

    fn remove_attachment(
        &self,
        key: &EntityKey,
        attachment_id: &str,
    ) -> Result<Option<Attachment>, DatabaseError> {
        let removed = self.mutate_entity(key, |record| {
            match record.attachments.iter().position(|a| a.id == attachment_id) {
                Some(index) => (Some(record.attachments.remove(index)), true),
                None => (None, false),
            }
        })?;
        Ok(removed.flatten())
    }

    fn take_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(ENTITIES)?;
            let removed: Option<EntityRecord> = match table.remove(key.storage_key().as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn referenced_file_ids(&self) -> Result<HashSet<String>, DatabaseError> {
        Ok(self
            .list_entities(None)?
            .iter()
            .flat_map(EntityRecord::file_ids)
            .collect())
    }
}
