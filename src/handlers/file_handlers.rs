//! Endpoints for stored files: whole-file upload, listing, rename, delete and
//! download.

use super::{AppState, parse_hash, user::UserId};
use crate::{
    errors::{AppError, UploadError},
    models::upload::{Decision, DownloadTarget},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use std::io;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

const DEFAULT_LIST_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct FilenameQuery {
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RenameReq {
    pub filename: String,
    pub new_filename: String,
}

/// `PUT /api/files/{hash}?filename=`: store a small file in one request.
pub async fn upload_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<FilenameQuery>,
    UserId(user): UserId,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let stored = state
        .uploads
        .upload_whole(&hash, &query.filename, body, &user)
        .await?;
    let status = match stored.decision {
        Decision::NoDuplicate => StatusCode::CREATED,
        Decision::DuplicateSameOwner | Decision::DuplicateNewOwner => StatusCode::OK,
    };
    Ok((status, Json(stored)))
}

/// `GET /api/files?limit=`: the caller's files, newest first.
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListFilesQuery>,
    UserId(user): UserId,
) -> Result<impl IntoResponse, AppError> {
    let files = state
        .uploads
        .list_files(&user, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(files))
}

/// `GET /api/files/{hash}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    UserId(_user): UserId,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    Ok(Json(state.uploads.get_file(&hash).await?))
}

/// `POST /api/files/{hash}/rename`
pub async fn rename_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    UserId(user): UserId,
    Json(req): Json<RenameReq>,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let renamed = state
        .uploads
        .rename_file(&hash, &req.filename, &req.new_filename, &user)
        .await?;
    Ok(Json(renamed))
}

/// `DELETE /api/files/{hash}?filename=`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<FilenameQuery>,
    UserId(user): UserId,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let deleted = state
        .uploads
        .delete_ownership(&hash, &query.filename, &user)
        .await?;
    Ok(Json(deleted))
}

/// `GET /api/files/{hash}/download?filename=`
///
/// Local objects are streamed; remote objects redirect to a presigned URL.
pub async fn download_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<FilenameQuery>,
    UserId(user): UserId,
) -> Result<Response, AppError> {
    let hash = parse_hash(&hash)?;
    let target = state
        .uploads
        .download_target(&hash, &query.filename, &user)
        .await?;

    match target {
        DownloadTarget::PresignedUrl(url) => Ok(Redirect::temporary(&url).into_response()),
        DownloadTarget::LocalFile {
            path,
            filename,
            size_bytes,
        } => {
            let file = File::open(&path).await.map_err(|err| match err.kind() {
                // Deleted by its last owner after the ownership check.
                io::ErrorKind::NotFound => {
                    UploadError::NotFound(format!("stored object for {hash}"))
                }
                _ => UploadError::from(err),
            })?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
            set_download_headers(response.headers_mut(), &filename, size_bytes);
            Ok(response)
        }
    }
}

fn set_download_headers(headers: &mut HeaderMap, filename: &str, size_bytes: i64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&size_bytes.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "\\\""));
    let value = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, value);
}
