//! Blob storage handler
//!
//! Blobs live under `blobs/` (workspace-wide) or `agents/<name>/blobs/`
//! (per agent); each blob is two files, `{id}` with the bytes and
//! `{id}.json` with metadata. Downloads support single byte ranges.

use crate::error::{Result, RouterError};
use crate::RouterState;
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use ploinky_core::is_safe_id;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncSeekExt;

/// Blob ids are 48 hex chars.
pub const BLOB_ID_LEN: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub uploaded_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: String,
    pub local_path: String,
    pub size: u64,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub filename: String,
    pub download_url: String,
}

pub fn mint_blob_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; BLOB_ID_LEN / 2];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn is_blob_id(s: &str) -> bool {
    s.len() == BLOB_ID_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// One inclusive byte range, parsed from a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Parse a single-range `Range: bytes=start-end` header against a known
/// length. Returns `None` for absent headers, an error for
/// unsatisfiable ones.
pub fn parse_range(header: Option<&str>, len: u64) -> std::result::Result<Option<ByteRange>, ()> {
    let Some(header) = header else {
        return Ok(None);
    };
    let spec = header.strip_prefix("bytes=").ok_or(())?;
    if spec.contains(',') {
        // multiple ranges unsupported
        return Err(());
    }

    let (start_raw, end_raw) = spec.split_once('-').ok_or(())?;
    let range = match (start_raw.is_empty(), end_raw.is_empty()) {
        // bytes=start-end
        (false, false) => {
            let start: u64 = start_raw.parse().map_err(|_| ())?;
            let end: u64 = end_raw.parse().map_err(|_| ())?;
            ByteRange { start, end }
        }
        // bytes=start-
        (false, true) => {
            let start: u64 = start_raw.parse().map_err(|_| ())?;
            ByteRange {
                start,
                end: len.saturating_sub(1),
            }
        }
        // bytes=-suffix
        (true, false) => {
            let suffix: u64 = end_raw.parse().map_err(|_| ())?;
            if suffix == 0 {
                return Err(());
            }
            ByteRange {
                start: len.saturating_sub(suffix),
                end: len.saturating_sub(1),
            }
        }
        (true, true) => return Err(()),
    };

    if range.start > range.end || range.start >= len {
        return Err(());
    }
    Ok(Some(ByteRange {
        start: range.start,
        end: range.end.min(len.saturating_sub(1)),
    }))
}

fn blob_dir(state: &RouterState, agent: Option<&str>) -> Result<PathBuf> {
    match agent {
        Some(agent) => {
            if !is_safe_id(agent) {
                return Err(RouterError::BadRequest("invalid agent id".to_string()));
            }
            Ok(state.store.agent_blobs_dir(agent))
        }
        None => Ok(state.store.blobs_dir()),
    }
}

fn filename_from_headers(headers: &HeaderMap) -> String {
    for name in ["x-file-name", "x-filename"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    if let Some(value) = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(filename) = value
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("filename="))
            .next()
        {
            return filename.trim_matches('"').to_string();
        }
    }
    "blob".to_string()
}

fn mime_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-mime-type")
        .or_else(|| headers.get(header::CONTENT_TYPE))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Store a blob and write its metadata sidecar.
pub fn save_blob(
    state: &RouterState,
    agent: Option<&str>,
    filename: String,
    mime: String,
    data: &[u8],
) -> Result<UploadResponse> {
    let dir = blob_dir(state, agent)?;
    std::fs::create_dir_all(&dir).map_err(|e| RouterError::Internal(e.to_string()))?;

    let id = mint_blob_id();
    let path = dir.join(&id);
    let meta = BlobMeta {
        id: id.clone(),
        filename: filename.clone(),
        mime: mime.clone(),
        size: data.len() as u64,
        agent: agent.map(|a| a.to_string()),
        uploaded_at: Utc::now(),
    };

    std::fs::write(&path, data).map_err(|e| RouterError::Internal(e.to_string()))?;
    ploinky_core::atomic_write(
        &dir.join(format!("{id}.json")),
        serde_json::to_string_pretty(&meta)
            .map_err(|e| RouterError::Internal(e.to_string()))?
            .as_bytes(),
    )
    .map_err(|e| RouterError::Internal(e.to_string()))?;

    let download_url = match agent {
        Some(agent) => format!("/blobs/{agent}/{id}"),
        None => format!("/blobs/{id}"),
    };

    Ok(UploadResponse {
        id,
        local_path: path.to_string_lossy().to_string(),
        size: meta.size,
        mime,
        agent: meta.agent.clone(),
        filename,
        download_url,
    })
}

/// `POST /blobs`
pub async fn upload_root(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    upload(&state, None, &headers, &body)
}

fn upload(
    state: &RouterState,
    agent: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let filename = filename_from_headers(headers);
    let mime = mime_from_headers(headers);
    match save_blob(state, agent, filename, mime, body) {
        Ok(response) => (StatusCode::CREATED, axum::Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST|GET|HEAD /blobs/{key}` — POST uploads for an agent, GET/HEAD
/// downloads a workspace blob.
pub async fn key_entry(
    State(state): State<Arc<RouterState>>,
    AxumPath(key): AxumPath<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match method {
        Method::POST => upload(&state, Some(&key), &headers, &body),
        Method::GET | Method::HEAD => download(&state, None, &key, &method, &headers).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// `GET|HEAD /blobs/{agent}/{id}`
pub async fn agent_entry(
    State(state): State<Arc<RouterState>>,
    AxumPath((agent, id)): AxumPath<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match method {
        Method::GET | Method::HEAD => download(&state, Some(&agent), &id, &method, &headers).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn download(
    state: &RouterState,
    agent: Option<&str>,
    id: &str,
    method: &Method,
    headers: &HeaderMap,
) -> Response {
    if !is_blob_id(id) {
        return RouterError::BadRequest("invalid blob id".to_string()).into_response();
    }
    let dir = match blob_dir(state, agent) {
        Ok(dir) => dir,
        Err(e) => return e.into_response(),
    };

    let path = dir.join(id);
    let Ok(file_meta) = tokio::fs::metadata(&path).await else {
        return RouterError::NotFound.into_response();
    };
    let len = file_meta.len();

    let meta: Option<BlobMeta> = std::fs::read_to_string(dir.join(format!("{id}.json")))
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok());
    let mime = meta
        .as_ref()
        .map(|m| m.mime.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let range = match parse_range(range_header, len) {
        Ok(range) => range,
        Err(()) => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{len}")) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_RANGE, value);
            }
            return response;
        }
    };

    let (status, start, slice_len) = match range {
        Some(range) => (
            StatusCode::PARTIAL_CONTENT,
            range.start,
            range.end - range.start + 1,
        ),
        None => (StatusCode::OK, 0, len),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, slice_len);
    if let Some(range) = range {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, len),
        );
    }

    if method == Method::HEAD {
        return builder
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return RouterError::NotFound.into_response(),
    };
    if start > 0 && file.seek(SeekFrom::Start(start)).await.is_err() {
        return RouterError::Internal("seek failed".to_string()).into_response();
    }

    use tokio::io::AsyncReadExt;
    let reader = file.take(slice_len);
    let stream = tokio_util::io::ReaderStream::new(reader);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
