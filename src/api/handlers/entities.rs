use std::collections::BTreeMap;

use axum::extract::{Multipart, Path, State};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::{ApiError, AppJson, JSend};
use crate::blob_store::StoreOptions;
use crate::storage::models::{
    Attachment, EntityKey, EntityKind, EntityRecord, FileRef, ImageSlot,
};
use crate::storage::RecordStore;
use crate::AppState;

/// The settings singleton lives under this id unless told otherwise.
const SETTINGS_ID: &str = "global";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileRefResponse {
    pub id: String,
    pub mime_type: Option<String>,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    pub file: FileRefResponse,
    pub id: String,
    pub label: String,
}

#[derive(Debug, Serialize)]
pub struct EntityResponse {
    pub attachments: Vec<AttachmentResponse>,
    pub created_at: String,
    pub id: String,
    pub images: BTreeMap<&'static str, FileRefResponse>,
    pub kind: EntityKind,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct ClearImageResponse {
    pub removed: Option<FileRefResponse>,
}

#[derive(Debug, Serialize)]
pub struct RemoveAttachmentResponse {
    pub removed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateEntityRequest {
    #[serde(default)]
    pub id: Option<String>,
}

/// A file pulled out of a multipart body.
struct Upload {
    data: Bytes,
    file_name: Option<String>,
    content_type: Option<String>,
    label: Option<String>,
}

impl Upload {
    fn store_options(&self) -> StoreOptions {
        let options = StoreOptions::named(self.file_name.as_deref().unwrap_or("upload"));
        // Browsers send octet-stream when they don't know; let the extension decide.
        match self.content_type.as_deref() {
            Some(ct) if ct != "application/octet-stream" => options.with_mime_type(ct),
            _ => options,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_entity(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    AppJson(req): AppJson<CreateEntityRequest>,
) -> Result<Json<JSend<EntityResponse>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let id = match req.id {
        Some(id) => id,
        None if kind == EntityKind::Settings => SETTINGS_ID.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    let key = entity_key(kind, id)?;

    let record = state
        .db
        .create_entity(&key)?
        .ok_or_else(|| ApiError::conflict(format!("entity '{key}' already exists")))?;

    tracing::debug!(entity = %key, "Created entity");
    Ok(JSend::success(entity_to_response(&record)))
}

pub async fn get_entity(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<JSend<EntityResponse>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    let record = state
        .db
        .get_entity(&key)?
        .ok_or_else(|| ApiError::not_found("Entity not found"))?;

    Ok(JSend::success(entity_to_response(&record)))
}

pub async fn delete_entity(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<JSend<()>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    if !state.lifecycle.delete_entity(&key).await? {
        return Err(ApiError::not_found("Entity not found"));
    }
    Ok(JSend::success(()))
}

pub async fn replace_image(
    State(state): State<Arc<AppState>>,
    Path((kind, id, slot)): Path<(String, String, String)>,
    multipart: Multipart,
) -> Result<Json<JSend<FileRefResponse>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    let slot = parse_slot(&slot)?;
    let upload = read_upload(multipart, state.config.max_upload_size).await?;

    let options = upload.store_options();
    let file = state
        .lifecycle
        .replace_image(&key, slot, upload.data, options)
        .await?;

    Ok(JSend::success(file_ref_to_response(&file)))
}

pub async fn clear_image(
    State(state): State<Arc<AppState>>,
    Path((kind, id, slot)): Path<(String, String, String)>,
) -> Result<Json<JSend<ClearImageResponse>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    let slot = parse_slot(&slot)?;
    let removed = state.lifecycle.clear_image(&key, slot).await?;

    Ok(JSend::success(ClearImageResponse {
        removed: removed.as_ref().map(file_ref_to_response),
    }))
}

pub async fn list_attachments(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<JSend<Vec<AttachmentResponse>>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    let attachments = state.lifecycle.list_attachments(&key)?;

    Ok(JSend::success(
        attachments.iter().map(attachment_to_response).collect(),
    ))
}

pub async fn add_attachment(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    let upload = read_upload(multipart, state.config.max_upload_size).await?;

    let label = upload
        .label
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ApiError::bad_request("label field is required"))?
        .to_string();

    let options = upload.store_options();
    let attachment = state
        .lifecycle
        .add_attachment(&key, &label, upload.data, options)
        .await?;

    Ok(JSend::success(attachment_to_response(&attachment)))
}

pub async fn remove_attachment(
    State(state): State<Arc<AppState>>,
    Path((kind, id, attachment_id)): Path<(String, String, String)>,
) -> Result<Json<JSend<RemoveAttachmentResponse>>, ApiError> {
    let key = entity_key(parse_kind(&kind)?, id)?;
    let removed = state
        .lifecycle
        .remove_attachment(&key, &attachment_id)
        .await?;

    Ok(JSend::success(RemoveAttachmentResponse {
        removed: removed.is_some(),
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_kind(raw: &str) -> Result<EntityKind, ApiError> {
    raw.parse::<EntityKind>().map_err(ApiError::bad_request)
}

fn parse_slot(raw: &str) -> Result<ImageSlot, ApiError> {
    raw.parse::<ImageSlot>().map_err(ApiError::bad_request)
}

fn entity_key(kind: EntityKind, id: String) -> Result<EntityKey, ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::bad_request("entity id must not be empty"));
    }
    if id.contains('/') {
        return Err(ApiError::bad_request("entity id must not contain '/'"));
    }
    Ok(EntityKey::new(kind, id))
}

async fn read_upload(mut multipart: Multipart, max_upload_size: u64) -> Result<Upload, ApiError> {
    let mut data: Option<Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut label: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                content_type = field.content_type().map(|s| s.to_string());

                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

                if bytes.len() as u64 > max_upload_size {
                    return Err(ApiError::payload_too_large(format!(
                        "File exceeds maximum upload size of {max_upload_size} bytes"
                    )));
                }
                data = Some(bytes);
            }
            "label" => {
                label = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Invalid label: {e}")))?,
                );
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let data = data.ok_or_else(|| ApiError::bad_request("file field is required"))?;

    Ok(Upload {
        data,
        file_name,
        content_type,
        label,
    })
}

fn file_ref_to_response(file: &FileRef) -> FileRefResponse {
    FileRefResponse {
        id: file.id.clone(),
        mime_type: file.mime_type.clone(),
        url: file.url(),
    }
}

fn attachment_to_response(attachment: &Attachment) -> AttachmentResponse {
    AttachmentResponse {
        file: file_ref_to_response(&attachment.file),
        id: attachment.id.clone(),
        label: attachment.label.clone(),
    }
}

fn entity_to_response(record: &EntityRecord) -> EntityResponse {
    EntityResponse {
        attachments: record
            .attachments
            .iter()
            .map(attachment_to_response)
            .collect(),
        created_at: record.created_at.to_rfc3339(),
        id: record.id.clone(),
        images: record
            .images
            .iter()
            .map(|(slot, file)| (slot.as_str(), file_ref_to_response(file)))
            .collect(),
        kind: record.kind,
        updated_at: record.updated_at.to_rfc3339(),
    }
}
