use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cms_files::blob_store::{
    BlobMetadata, BlobStore, BlobStoreError, BoxReader, ListOptions, ListResult, LocalStore,
    StoreOptions, StoredFile,
};
use cms_files::lifecycle::{FileLifecycle, LifecycleError};
use cms_files::storage::models::{
    Attachment, EntityKey, EntityKind, EntityRecord, FileRef, ImageSlot,
};
use cms_files::storage::{Database, DatabaseError, RecordStore};

struct Harness {
    _dir: tempfile::TempDir,
    db: Database,
    blobs: Arc<LocalStore>,
    lifecycle: FileLifecycle,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let blobs = Arc::new(LocalStore::new(dir.path().join("files")).unwrap());
    let lifecycle = FileLifecycle::new(blobs.clone(), Arc::new(db.clone()));
    Harness {
        _dir: dir,
        db,
        blobs,
        lifecycle,
    }
}

fn png(name: &str) -> StoreOptions {
    StoreOptions::named(name).with_mime_type("image/png")
}

/// Every reference in the record must resolve to a stored blob.
async fn assert_no_dangling(h: &Harness, key: &EntityKey) {
    let record = h.db.get_entity(key).unwrap().unwrap();
    for id in record.file_ids() {
        assert!(
            h.blobs.exists(&id).await.unwrap(),
            "record references missing blob {id}"
        );
    }
}

#[tokio::test]
async fn test_replace_image_deletes_previous_blob() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "news");
    h.db.create_entity(&key).unwrap();

    let first = h
        .lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("one"), png("one.png"))
        .await
        .unwrap();
    assert_no_dangling(&h, &key).await;

    let second = h
        .lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("two"), png("two.png"))
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.mime_type.as_deref(), Some("image/png"));

    assert!(!h.blobs.exists(&first.id).await.unwrap());
    assert!(h.blobs.exists(&second.id).await.unwrap());
    assert_eq!(h.blobs.count().await.unwrap(), 1);

    let record = h.db.get_entity(&key).unwrap().unwrap();
    assert_eq!(record.images.get(ImageSlot::PreviewImage), Some(&second));
    assert_no_dangling(&h, &key).await;
}

#[tokio::test]
async fn test_clear_image() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Person, "jane");
    h.db.create_entity(&key).unwrap();

    let portrait = h
        .lifecycle
        .replace_image(&key, ImageSlot::Portrait, Bytes::from("face"), png("jane.png"))
        .await
        .unwrap();

    let cleared = h.lifecycle.clear_image(&key, ImageSlot::Portrait).await.unwrap();
    assert_eq!(cleared, Some(portrait));
    assert_eq!(h.blobs.count().await.unwrap(), 0);

    // Clearing an empty slot is a no-op
    assert_eq!(
        h.lifecycle.clear_image(&key, ImageSlot::Portrait).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_settings_image_slots_are_independent() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Settings, "global");
    h.db.create_entity(&key).unwrap();

    let hero = h
        .lifecycle
        .replace_image(&key, ImageSlot::HeroImage, Bytes::from("hero"), png("hero.png"))
        .await
        .unwrap();
    h.lifecycle
        .replace_image(&key, ImageSlot::PopupImage, Bytes::from("p1"), png("p1.png"))
        .await
        .unwrap();
    h.lifecycle
        .replace_image(&key, ImageSlot::PopupImage, Bytes::from("p2"), png("p2.png"))
        .await
        .unwrap();

    // Replacing the popup never touches the hero image
    assert!(h.blobs.exists(&hero.id).await.unwrap());
    assert_eq!(h.blobs.count().await.unwrap(), 2);
    assert_no_dangling(&h, &key).await;
}

#[tokio::test]
async fn test_slot_not_available_for_kind() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Procurement, "tender");
    h.db.create_entity(&key).unwrap();

    let result = h
        .lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("x"), png("x.png"))
        .await;
    assert!(matches!(
        result,
        Err(LifecycleError::SlotNotAvailable {
            kind: EntityKind::Procurement,
            slot: ImageSlot::PreviewImage
        })
    ));

    let person = EntityKey::new(EntityKind::Person, "jane");
    h.db.create_entity(&person).unwrap();
    let result = h
        .lifecycle
        .add_attachment(&person, "CV", Bytes::from("cv"), StoreOptions::named("cv.pdf"))
        .await;
    assert!(matches!(
        result,
        Err(LifecycleError::AttachmentsNotAvailable(EntityKind::Person))
    ));
    assert_eq!(h.blobs.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_entity_is_rejected_before_storing() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "ghost");

    let result = h
        .lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("x"), png("x.png"))
        .await;
    assert!(matches!(result, Err(LifecycleError::EntityNotFound(_))));

    let result = h
        .lifecycle
        .add_attachment(&key, "Doc", Bytes::from("x"), StoreOptions::named("x.pdf"))
        .await;
    assert!(matches!(result, Err(LifecycleError::EntityNotFound(_))));

    assert_eq!(h.blobs.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_add_and_remove_attachments() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Procurement, "tender");
    h.db.create_entity(&key).unwrap();

    let terms = h
        .lifecycle
        .add_attachment(&key, "Terms", Bytes::from("terms"), StoreOptions::named("terms.pdf"))
        .await
        .unwrap();
    let annex = h
        .lifecycle
        .add_attachment(&key, "Annex", Bytes::from("annex"), StoreOptions::named("annex.pdf"))
        .await
        .unwrap();
    assert_eq!(terms.id, terms.file.id);
    assert_eq!(terms.file.mime_type.as_deref(), Some("application/pdf"));

    let listed = h.lifecycle.list_attachments(&key).unwrap();
    assert_eq!(listed, vec![terms.clone(), annex.clone()]);

    let removed = h.lifecycle.remove_attachment(&key, &terms.id).await.unwrap();
    assert_eq!(removed, Some(terms.clone()));
    assert!(!h.blobs.exists(&terms.id).await.unwrap());
    assert!(h.blobs.exists(&annex.id).await.unwrap());

    // Unknown ids leave everything alone
    assert_eq!(
        h.lifecycle.remove_attachment(&key, "unknown").await.unwrap(),
        None
    );
    assert_eq!(h.lifecycle.list_attachments(&key).unwrap(), vec![annex]);
    assert_no_dangling(&h, &key).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attachment_adds_are_all_kept() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "busy");
    h.db.create_entity(&key).unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let lifecycle = h.lifecycle.clone();
            let key = key.clone();
            tokio::spawn(async move {
                lifecycle
                    .add_attachment(
                        &key,
                        &format!("Doc {i}"),
                        Bytes::from(format!("content {i}")),
                        StoreOptions::named(format!("doc-{i}.pdf")),
                    )
                    .await
            })
        })
        .collect();

    let mut added = HashSet::new();
    for task in tasks {
        added.insert(task.await.unwrap().unwrap().id);
    }

    let record = h.db.get_entity(&key).unwrap().unwrap();
    let stored: HashSet<_> = record.attachments.iter().map(|a| a.id.clone()).collect();
    assert_eq!(stored, added);
    assert_eq!(stored.len(), 8);
    assert_no_dangling(&h, &key).await;
}

#[tokio::test]
async fn test_delete_entity_removes_all_blobs() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "gone");
    h.db.create_entity(&key).unwrap();

    h.lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("img"), png("img.png"))
        .await
        .unwrap();
    h.lifecycle
        .add_attachment(&key, "Doc", Bytes::from("doc"), StoreOptions::named("doc.pdf"))
        .await
        .unwrap();
    assert_eq!(h.blobs.count().await.unwrap(), 2);

    assert!(h.lifecycle.delete_entity(&key).await.unwrap());
    assert!(h.db.get_entity(&key).unwrap().is_none());
    assert_eq!(h.blobs.count().await.unwrap(), 0);

    assert!(!h.lifecycle.delete_entity(&key).await.unwrap());
}

#[tokio::test]
async fn test_sweep_orphans_respects_references_and_grace() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "kept");
    h.db.create_entity(&key).unwrap();

    let kept = h
        .lifecycle
        .add_attachment(&key, "Doc", Bytes::from("doc"), StoreOptions::named("doc.pdf"))
        .await
        .unwrap();
    let orphan = h
        .blobs
        .store(Bytes::from("orphan"), StoreOptions::named("orphan.png"))
        .await
        .unwrap();

    // A generous grace period protects fresh uploads
    let stats = h
        .lifecycle
        .sweep_orphans(chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.deleted, 0);
    assert!(h.blobs.exists(&orphan.id).await.unwrap());

    let stats = h
        .lifecycle
        .sweep_orphans(chrono::Duration::seconds(-1))
        .await
        .unwrap();
    assert_eq!(stats.deleted, 1);
    assert!(!h.blobs.exists(&orphan.id).await.unwrap());
    assert!(h.blobs.exists(&kept.id).await.unwrap());
}

/// Record store that reports entities as present but fails or loses every write.
struct BrokenRecords {
    inner: Database,
    vanish: bool,
}

impl BrokenRecords {
    fn write_failure(&self) -> DatabaseError {
        DatabaseError::Io(std::io::Error::other("disk full"))
    }
}

impl RecordStore for BrokenRecords {
    fn get_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError> {
        self.inner.get_entity(key)
    }

    fn entity_exists(&self, key: &EntityKey) -> Result<bool, DatabaseError> {
        self.inner.entity_exists(key)
    }

    fn replace_image(
        &self,
        _key: &EntityKey,
        _slot: ImageSlot,
        _file: Option<FileRef>,
    ) -> Result<Option<Option<FileRef>>, DatabaseError> {
        if self.vanish {
            return Ok(None);
        }
        Err(self.write_failure())
    }

    fn append_attachment(
        &self,
        _key: &EntityKey,
        _attachment: Attachment,
    ) -> Result<bool, DatabaseError> {
        if self.vanish {
            return Ok(false);
        }
        Err(self.write_failure())
    }

    fn remove_attachment(
        &self,
        _key: &EntityKey,
        _attachment_id: &str,
    ) -> Result<Option<Attachment>, DatabaseError> {
        Err(self.write_failure())
    }

    fn take_entity(&self, _key: &EntityKey) -> Result<Option<EntityRecord>, DatabaseError> {
        Err(self.write_failure())
    }

    fn referenced_file_ids(&self) -> Result<HashSet<String>, DatabaseError> {
        self.inner.referenced_file_ids()
    }
}

#[tokio::test]
async fn test_failed_commit_keeps_old_reference_and_orphans_new_blob() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "fragile");
    h.db.create_entity(&key).unwrap();

    let original = h
        .lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("v1"), png("v1.png"))
        .await
        .unwrap();

    let broken = FileLifecycle::new(
        h.blobs.clone(),
        Arc::new(BrokenRecords {
            inner: h.db.clone(),
            vanish: false,
        }),
    );

    let result = broken
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("v2"), png("v2.png"))
        .await;
    assert!(matches!(result, Err(LifecycleError::Database(_))));

    let result = broken
        .add_attachment(&key, "Doc", Bytes::from("doc"), StoreOptions::named("doc.pdf"))
        .await;
    assert!(matches!(result, Err(LifecycleError::Database(_))));

    // The old image is still referenced and still stored
    let record = h.db.get_entity(&key).unwrap().unwrap();
    assert_eq!(record.images.get(ImageSlot::PreviewImage), Some(&original));
    assert!(record.attachments.is_empty());
    assert!(h.blobs.exists(&original.id).await.unwrap());
    assert_no_dangling(&h, &key).await;

    // The two uploads are orphans and the sweep reclaims them
    assert_eq!(h.blobs.count().await.unwrap(), 3);
    let stats = h
        .lifecycle
        .sweep_orphans(chrono::Duration::seconds(-1))
        .await
        .unwrap();
    assert_eq!(stats.deleted, 2);
    assert!(h.blobs.exists(&original.id).await.unwrap());
}

#[tokio::test]
async fn test_entity_vanishing_before_commit_is_not_found() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "fleeting");
    h.db.create_entity(&key).unwrap();

    let racing = FileLifecycle::new(
        h.blobs.clone(),
        Arc::new(BrokenRecords {
            inner: h.db.clone(),
            vanish: true,
        }),
    );

    let result = racing
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("x"), png("x.png"))
        .await;
    assert!(matches!(result, Err(LifecycleError::EntityNotFound(_))));

    let result = racing
        .add_attachment(&key, "Doc", Bytes::from("x"), StoreOptions::named("x.pdf"))
        .await;
    assert!(matches!(result, Err(LifecycleError::EntityNotFound(_))));

    // Nothing points at the stored blobs
    assert!(h.db.get_entity(&key).unwrap().unwrap().file_ids().is_empty());
    assert_eq!(h.blobs.count().await.unwrap(), 2);
}

/// Blob store whose deletes always fail; everything else goes to the wrapped store.
struct UndeletableBlobs {
    inner: Arc<LocalStore>,
}

#[async_trait]
impl BlobStore for UndeletableBlobs {
    async fn store(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<BlobMetadata, BlobStoreError> {
        self.inner.store(content, options).await
    }

    async fn get(&self, id: &str) -> Result<Option<StoredFile>, BlobStoreError> {
        self.inner.get(id).await
    }

    async fn get_stream(&self, id: &str) -> Result<Option<BoxReader>, BlobStoreError> {
        self.inner.get_stream(id).await
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>, BlobStoreError> {
        self.inner.get_metadata(id).await
    }

    async fn exists(&self, id: &str) -> Result<bool, BlobStoreError> {
        self.inner.exists(id).await
    }

    async fn delete(&self, _id: &str) -> Result<bool, BlobStoreError> {
        Err(BlobStoreError::Backend("bucket is read-only".to_string()))
    }

    async fn list(&self, options: ListOptions) -> Result<ListResult, BlobStoreError> {
        self.inner.list(options).await
    }

    async fn count(&self) -> Result<u64, BlobStoreError> {
        self.inner.count().await
    }
}

#[tokio::test]
async fn test_failed_old_blob_delete_after_commit_leaves_an_orphan() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "sticky");
    h.db.create_entity(&key).unwrap();

    let old = h
        .lifecycle
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("old"), png("old.png"))
        .await
        .unwrap();

    let undeletable = FileLifecycle::new(
        Arc::new(UndeletableBlobs {
            inner: h.blobs.clone(),
        }),
        Arc::new(h.db.clone()),
    );
    let result = undeletable
        .replace_image(&key, ImageSlot::PreviewImage, Bytes::from("new"), png("new.png"))
        .await;
    assert!(matches!(
        result,
        Err(LifecycleError::Blob(BlobStoreError::Backend(_)))
    ));

    // The commit stands: the record points at the new blob
    let record = h.db.get_entity(&key).unwrap().unwrap();
    let current = record.images.get(ImageSlot::PreviewImage).unwrap().clone();
    assert_ne!(current.id, old.id);
    assert!(h.blobs.exists(&current.id).await.unwrap());
    assert_no_dangling(&h, &key).await;

    // The replaced blob is still stored but nothing references it
    assert!(h.blobs.exists(&old.id).await.unwrap());
    assert!(!h.db.referenced_file_ids().unwrap().contains(&old.id));

    let stats = h
        .lifecycle
        .sweep_orphans(chrono::Duration::seconds(-1))
        .await
        .unwrap();
    assert_eq!(stats.deleted, 1);
    assert!(!h.blobs.exists(&old.id).await.unwrap());
    assert!(h.blobs.exists(&current.id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replacements_of_one_slot_never_dangle() {
    let h = harness();
    let key = EntityKey::new(EntityKind::Post, "contested");
    h.db.create_entity(&key).unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let lifecycle = h.lifecycle.clone();
            let key = key.clone();
            tokio::spawn(async move {
                lifecycle
                    .replace_image(
                        &key,
                        ImageSlot::PreviewImage,
                        Bytes::from(format!("image {i}")),
                        png(&format!("image-{i}.png")),
                    )
                    .await
            })
        })
        .collect();

    let mut uploaded = HashSet::new();
    for task in tasks {
        uploaded.insert(task.await.unwrap().unwrap().id);
    }

    // One upload wins the slot; every other one was deleted by its successor
    let record = h.db.get_entity(&key).unwrap().unwrap();
    let winner = record.images.get(ImageSlot::PreviewImage).unwrap();
    assert!(uploaded.contains(&winner.id));
    assert_no_dangling(&h, &key).await;
    assert_eq!(h.blobs.count().await.unwrap(), 1);
}
