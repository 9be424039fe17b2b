use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, Pagination};
use crate::store::LinkEntry;
use crate::upload::TransportStatus;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub byte_size: u64,
    pub content_hash: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub byte_size: u64,
    pub content_hash: String,
    pub linked_at: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

/// What the multipart body carried for the upload
struct ReceivedFile {
    name: String,
    data: Bytes,
    status: TransportStatus,
}

// ============================================================================
// Handlers
// ============================================================================

/// Multipart upload. The `file` field carries the content and its filename;
/// an optional `name` field overrides that filename.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let received = read_upload(multipart).await?;

    // A body cut off by the size limit never reached us in full, so the
    // request's own length is the best size we can report.
    let declared_size = match received.status {
        TransportStatus::SizeLimitExceeded => content_length(&headers),
        _ => received.data.len() as u64,
    };

    let hash = state
        .manager
        .upload(
            &namespace,
            &received.name,
            &received.data,
            Some(declared_size),
            Some(received.status),
        )
        .await?;

    Ok(JSend::success(UploadResponse {
        byte_size: received.data.len() as u64,
        content_hash: hash.to_string(),
        name: received.name,
        namespace,
    }))
}

pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (file, byte_size) = state.manager.open_file(&namespace, &name).await?;

    let mut response = (StatusCode::OK, Body::from_stream(ReaderStream::new(file))).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(byte_size));

    let disposition = format!("attachment; filename=\"{}\"", disposition_filename(&name));
    match disposition.parse() {
        Ok(value) => headers.insert(header::CONTENT_DISPOSITION, value),
        Err(_) => headers.insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_static("attachment"),
        ),
    };

    tracing::debug!(namespace = %namespace, name = %name, byte_size, "Serving file");
    Ok(response)
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let entries = state.manager.list_entries(&namespace).await?;
    let total = entries.len() as u64;
    let items: Vec<FileResponse> = entries
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(entry_to_response)
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<JSend<()>>, ApiError> {
    let hash = state.manager.delete(&namespace, &name).await?;
    tracing::debug!(namespace = %namespace, name = %name, content_hash = %hash, "Deleted file");
    Ok(JSend::success(()))
}

// ============================================================================
// Helpers
// ============================================================================

async fn read_upload(mut multipart: Multipart) -> Result<ReceivedFile, ApiError> {
    let mut file: Option<(Option<String>, Bytes)> = None;
    let mut name_override: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return transport_failure(e, file, name_override),
        };

        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(data) => file = Some((file_name, data)),
                    Err(e) => {
                        return transport_failure(e, Some((file_name, Bytes::new())), name_override)
                    }
                }
            }
            "name" => {
                let name = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid name: {}", e.body_text())))?;
                name_override = Some(name.trim().to_string());
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    Ok(match file {
        Some((file_name, data)) => ReceivedFile {
            name: name_override.or(file_name).unwrap_or_default(),
            data,
            status: TransportStatus::Ok,
        },
        None => ReceivedFile {
            name: name_override.unwrap_or_default(),
            data: Bytes::new(),
            status: TransportStatus::NoFile,
        },
    })
}

/// Hand an oversized body to the pipeline as a size status so it is reported
/// the same way as any other oversized upload. Other read errors are plain
/// bad requests.
fn transport_failure(
    e: axum::extract::multipart::MultipartError,
    file: Option<(Option<String>, Bytes)>,
    name_override: Option<String>,
) -> Result<ReceivedFile, ApiError> {
    if e.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return Err(ApiError::bad_request(format!(
            "Invalid multipart data: {}",
            e.body_text()
        )));
    }
    let file_name = file.and_then(|(name, _)| name);
    Ok(ReceivedFile {
        name: name_override.or(file_name).unwrap_or_default(),
        data: Bytes::new(),
        status: TransportStatus::SizeLimitExceeded,
    })
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Quotes, backslashes and anything outside printable ASCII would break the
/// quoted `filename` parameter.
fn disposition_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}

fn entry_to_response(entry: &LinkEntry) -> FileResponse {
    FileResponse {
        byte_size: entry.byte_size,
        content_hash: entry.content_hash.to_string(),
        linked_at: entry.linked_at.to_rfc3339(),
        name: entry.name.clone(),
    }
}
