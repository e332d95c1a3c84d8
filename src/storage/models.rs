use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob_store::BlobMetadata;

/// Public route that serves a blob's content.
pub const FILE_ROUTE_PREFIX: &str = "/api/files";

/// Reference to a blob, embedded in the owning entity's record.
///
/// Carries just enough to build a retrieval URL without asking the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl FileRef {
    pub fn url(&self) -> String {
        format!("{FILE_ROUTE_PREFIX}/{}", self.id)
    }
}

impl From<&BlobMetadata> for FileRef {
    fn from(meta: &BlobMetadata) -> Self {
        FileRef {
            id: meta.id.clone(),
            mime_type: Some(meta.mime_type.clone()),
        }
    }
}

/// A labeled file in an entity's attachment collection.
///
/// `id` is always the id of the referenced blob; the collection is keyed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub label: String,
    pub file: FileRef,
}

impl Attachment {
    pub fn new(label: impl Into<String>, file: FileRef) -> Self {
        Attachment {
            id: file.id.clone(),
            label: label.into(),
            file,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    DirectoryEntry,
    Person,
    Post,
    Procurement,
    Settings,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::DirectoryEntry => "directory_entry",
            EntityKind::Person => "person",
            EntityKind::Post => "post",
            EntityKind::Procurement => "procurement",
            EntityKind::Settings => "settings",
        }
    }

    /// Image slots that entities of this kind carry.
    pub fn image_slots(&self) -> &'static [ImageSlot] {
        match self {
            EntityKind::DirectoryEntry => &[ImageSlot::PreviewImage],
            EntityKind::Person => &[ImageSlot::Portrait],
            EntityKind::Post => &[ImageSlot::PreviewImage],
            EntityKind::Procurement => &[],
            EntityKind::Settings => &[
                ImageSlot::HeroImage,
                ImageSlot::PopupImage,
                ImageSlot::AboutUsHeroImage,
            ],
        }
    }

    pub fn has_image_slot(&self, slot: ImageSlot) -> bool {
        self.image_slots().contains(&slot)
    }

    pub fn has_attachments(&self) -> bool {
        matches!(self, EntityKind::Post | EntityKind::Procurement)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory_entry" => Ok(EntityKind::DirectoryEntry),
            "person" => Ok(EntityKind::Person),
            "post" => Ok(EntityKind::Post),
            "procurement" => Ok(EntityKind::Procurement),
            "settings" => Ok(EntityKind::Settings),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// Fields that hold at most one file reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageSlot {
    AboutUsHeroImage,
    HeroImage,
    PopupImage,
    Portrait,
    PreviewImage,
}

impl ImageSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSlot::AboutUsHeroImage => "aboutUsHeroImage",
            ImageSlot::HeroImage => "heroImage",
            ImageSlot::PopupImage => "popupImage",
            ImageSlot::Portrait => "portrait",
            ImageSlot::PreviewImage => "previewImage",
        }
    }
}

impl fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aboutUsHeroImage" => Ok(ImageSlot::AboutUsHeroImage),
            "heroImage" => Ok(ImageSlot::HeroImage),
            "popupImage" => Ok(ImageSlot::PopupImage),
            "portrait" => Ok(ImageSlot::Portrait),
            "previewImage" => Ok(ImageSlot::PreviewImage),
            other => Err(format!("unknown image slot '{other}'")),
        }
    }
}

/// Single-slot image fields of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSlots {
    #[serde(default)]
    pub about_us_hero_image: Option<FileRef>,
    #[serde(default)]
    pub hero_image: Option<FileRef>,
    #[serde(default)]
    pub popup_image: Option<FileRef>,
    #[serde(default)]
    pub portrait: Option<FileRef>,
    #[serde(default)]
    pub preview_image: Option<FileRef>,
}

impl ImageSlots {
    pub fn get(&self, slot: ImageSlot) -> Option<&FileRef> {
        match slot {
            ImageSlot::AboutUsHeroImage => self.about_us_hero_image.as_ref(),
            ImageSlot::HeroImage => self.hero_image.as_ref(),
            ImageSlot::PopupImage => self.popup_image.as_ref(),
            ImageSlot::Portrait => self.portrait.as_ref(),
            ImageSlot::PreviewImage => self.preview_image.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, slot: ImageSlot) -> &mut Option<FileRef> {
        match slot {
            ImageSlot::AboutUsHeroImage => &mut self.about_us_hero_image,
            ImageSlot::HeroImage => &mut self.hero_image,
            ImageSlot::PopupImage => &mut self.popup_image,
            ImageSlot::Portrait => &mut self.portrait,
            ImageSlot::PreviewImage => &mut self.preview_image,
        }
    }

    /// All populated slots, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (ImageSlot, &FileRef)> {
        [
            ImageSlot::AboutUsHeroImage,
            ImageSlot::HeroImage,
            ImageSlot::PopupImage,
            ImageSlot::Portrait,
            ImageSlot::PreviewImage,
        ]
        .into_iter()
        .filter_map(move |slot| self.get(slot).map(|file| (slot, file)))
    }
}

/// Identifies one entity row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        EntityKey {
            kind,
            id: id.into(),
        }
    }

    /// Key in the entities table: `{kind}/{id}`.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// The file-bearing part of a CMS entity, stored in redb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub images: ImageSlots,
    /// Append-ordered
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(key: &EntityKey) -> Self {
        let now = Utc::now();
        EntityRecord {
            id: key.id.clone(),
            kind: key.kind,
            images: ImageSlots::default(),
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }

    /// Ids of every blob this record references.
    pub fn file_ids(&self) -> Vec<String> {
        self.images
            .iter()
            .map(|(_, file)| file.id.clone())
            .chain(self.attachments.iter().map(|a| a.file.id.clone()))
            .collect()
    }
}
