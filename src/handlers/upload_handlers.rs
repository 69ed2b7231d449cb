//! Chunked upload endpoints under `/api/uploads/{hash}`.

use super::{AppState, parse_hash, user::UserId};
use crate::errors::AppError;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct InstantQuery {
    pub filename: String,
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteReq {
    pub filename: String,
    pub chunk_count: u32,
    pub file_size: u64,
}

/// `GET /api/uploads/{hash}/instant?filename=&size=`
pub async fn instant_check(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<InstantQuery>,
    UserId(user): UserId,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let check = state
        .uploads
        .instant_check(&hash, &query.filename, &user, query.size)
        .await?;
    Ok(Json(check))
}

/// `GET /api/uploads/{hash}`: start or resume a session.
pub async fn probe_upload(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    UserId(user): UserId,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let resume = state.uploads.probe_upload(&hash, &user).await?;
    Ok(Json(resume))
}

/// `PUT /api/uploads/{hash}/chunks/{index}` with the raw chunk as body.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((hash, index)): Path<(String, u32)>,
    UserId(user): UserId,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let ack = state.uploads.accept_chunk(&hash, index, body, &user).await?;
    Ok(Json(ack))
}

/// `POST /api/uploads/{hash}/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    UserId(user): UserId,
    Json(req): Json<CompleteReq>,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let result = state
        .uploads
        .complete_upload(&hash, req.chunk_count, &req.filename, req.file_size, &user)
        .await?;
    let status = if result.linked_existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(result)))
}

/// `DELETE /api/uploads/{hash}`
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    UserId(user): UserId,
) -> Result<impl IntoResponse, AppError> {
    let hash = parse_hash(&hash)?;
    let phase = state.uploads.abort_upload(&hash, &user).await?;
    Ok(Json(json!({ "content_hash": hash, "phase": phase })))
}
