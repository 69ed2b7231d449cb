//! Route table for the upload service.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Chunked uploads** (`/api/uploads/{hash}`)
//!   - `GET    /api/uploads/{hash}/instant`: duplicate check before transfer
//!   - `GET    /api/uploads/{hash}`: start or resume, lists persisted chunks
//!   - `PUT    /api/uploads/{hash}/chunks/{index}`: upload one chunk
//!   - `POST   /api/uploads/{hash}/complete`: verify and commit
//!   - `DELETE /api/uploads/{hash}`: abort
//!
//! - **Stored files** (`/api/files`)
//!   - `GET    /api/files`: caller's files, newest first
//!   - `PUT    /api/files/{hash}`: single-request upload
//!   - `GET    /api/files/{hash}`: file record
//!   - `DELETE /api/files/{hash}`: drop the caller's reference
//!   - `POST   /api/files/{hash}/rename`
//!   - `GET    /api/files/{hash}/download`
//!
//! Every `/api` route requires the `x-user-id` header.

use crate::handlers::{
    AppState,
    file_handlers::{delete_file, download_file, get_file, list_files, rename_file, upload_file},
    health_handlers::{healthz, readyz},
    upload_handlers::{abort_upload, complete_upload, instant_check, probe_upload, put_chunk},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. `body_limit` caps request bodies and should match the
/// largest accepted chunk.
pub fn routes(body_limit: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // chunked uploads
        .route("/api/uploads/{hash}", get(probe_upload).delete(abort_upload))
        .route("/api/uploads/{hash}/instant", get(instant_check))
        .route("/api/uploads/{hash}/chunks/{index}", put(put_chunk))
        .route("/api/uploads/{hash}/complete", post(complete_upload))
        // stored files
        .route("/api/files", get(list_files))
        .route(
            "/api/files/{hash}",
            get(get_file).put(upload_file).delete(delete_file),
        )
        .route("/api/files/{hash}/rename", post(rename_file))
        .route("/api/files/{hash}/download", get(download_file))
        .layer(DefaultBodyLimit::max(body_limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::content_hash::ContentHash,
        services::test_helpers::{local_coordinator, memory_pool},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let state = AppState {
            uploads: local_coordinator(memory_pool().await, dir.path()),
            storage_dir: dir.path().to_path_buf(),
        };
        (routes(2 * 1024 * 1024).with_state(state), dir)
    }

    fn request(method: Method, uri: &str, user: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(body).unwrap()
    }

    fn json_request(uri: &str, user: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("x-user-id", user)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, req).await;
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _dir) = app().await;
        let (status, body) = send_json(&app, request(Method::GET, "/healthz", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn readyz_checks_database_and_disk() {
        let (app, _dir) = app().await;
        let (status, body) = send_json(&app, request(Method::GET, "/readyz", None, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["disk"]["ok"], true);
    }

    #[tokio::test]
    async fn api_requires_user_header() {
        let (app, _dir) = app().await;
        let (status, body) = send_json(&app, request(Method::GET, "/api/files", None, Body::empty())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);
    }

    #[tokio::test]
    async fn malformed_hash_is_bad_request() {
        let (app, _dir) = app().await;
        let (status, _) = send_json(
            &app,
            request(Method::GET, "/api/uploads/not-a-hash", Some("alice"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chunked_upload_over_http() {
        let (app, _dir) = app().await;
        let data = b"hello chunked world".to_vec();
        let hash = ContentHash::compute(&data);
        let base = format!("/api/uploads/{hash}");

        let (status, body) = send_json(
            &app,
            request(
                Method::GET,
                &format!("{base}/instant?filename=hello.txt&size=19"),
                Some("alice"),
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "no_duplicate");
        assert_eq!(body["should_upload"], true);

        let (status, body) =
            send_json(&app, request(Method::GET, &base, Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "awaiting_chunks");
        assert_eq!(body["uploaded"], json!([]));

        for (index, part) in [&data[..10], &data[10..]].into_iter().enumerate() {
            let (status, body) = send_json(
                &app,
                request(
                    Method::PUT,
                    &format!("{base}/chunks/{index}"),
                    Some("alice"),
                    Body::from(part.to_vec()),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["index"], index);
        }

        let (status, body) = send_json(
            &app,
            json_request(
                &format!("{base}/complete"),
                "alice",
                json!({"filename": "hello.txt", "chunk_count": 3, "file_size": 19}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("[2]"));

        let (status, body) = send_json(
            &app,
            json_request(
                &format!("{base}/complete"),
                "alice",
                json!({"filename": "hello.txt", "chunk_count": 2, "file_size": 19}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["phase"], "committed");
        assert_eq!(body["file"]["copies"], 1);

        let (status, body) = send(
            &app,
            request(
                Method::GET,
                &format!("/api/files/{hash}/download?filename=hello.txt"),
                Some("alice"),
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn integrity_failure_is_unprocessable() {
        let (app, _dir) = app().await;
        let hash = ContentHash::compute(b"genuine");
        let base = format!("/api/uploads/{hash}");

        send_json(&app, request(Method::GET, &base, Some("eve"), Body::empty())).await;
        send_json(
            &app,
            request(
                Method::PUT,
                &format!("{base}/chunks/0"),
                Some("eve"),
                Body::from("forged!"),
            ),
        )
        .await;
        let (status, body) = send_json(
            &app,
            json_request(
                &format!("{base}/complete"),
                "eve",
                json!({"filename": "x.bin", "chunk_count": 1, "file_size": 7}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], 422);

        let (status, _) = send_json(
            &app,
            request(Method::GET, &format!("/api/files/{hash}"), Some("eve"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn file_lifecycle_over_http() {
        let (app, _dir) = app().await;
        let data = b"small file".to_vec();
        let hash = ContentHash::compute(&data);
        let file = format!("/api/files/{hash}");

        let (status, body) = send_json(
            &app,
            request(
                Method::PUT,
                &format!("{file}?filename=a.txt"),
                Some("alice"),
                Body::from(data.clone()),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["decision"], "no_duplicate");

        let (status, body) = send_json(
            &app,
            request(
                Method::PUT,
                &format!("{file}?filename=b.txt"),
                Some("bob"),
                Body::from(data.clone()),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "duplicate_new_owner");
        assert_eq!(body["file"]["copies"], 2);

        let (status, body) = send_json(
            &app,
            json_request(
                &format!("{file}/rename"),
                "alice",
                json!({"filename": "a.txt", "new_filename": "renamed.txt"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filename"], "renamed.txt");

        let (status, body) =
            send_json(&app, request(Method::GET, "/api/files?limit=10", Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = send_json(
            &app,
            request(
                Method::DELETE,
                &format!("{file}?filename=renamed.txt"),
                Some("alice"),
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["physically_deleted"], false);

        let (status, body) = send_json(
            &app,
            request(
                Method::DELETE,
                &format!("{file}?filename=b.txt"),
                Some("bob"),
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["physically_deleted"], true);
    }

    #[tokio::test]
    async fn abort_then_abort_again_conflicts() {
        let (app, _dir) = app().await;
        let hash = ContentHash::compute(b"to abort");
        let base = format!("/api/uploads/{hash}");

        send_json(&app, request(Method::GET, &base, Some("alice"), Body::empty())).await;
        let (status, body) =
            send_json(&app, request(Method::DELETE, &base, Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "aborted");

        let (status, _) =
            send_json(&app, request(Method::DELETE, &base, Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn download_of_vanished_object_is_not_found() {
        let (app, _dir) = app().await;
        let data = b"soon gone".to_vec();
        let hash = ContentHash::compute(&data);
        let file = format!("/api/files/{hash}");

        let (status, body) = send_json(
            &app,
            request(
                Method::PUT,
                &format!("{file}?filename=gone.txt"),
                Some("alice"),
                Body::from(data.clone()),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let location = body["file"]["location"].as_str().unwrap().to_string();

        let download = format!("{file}/download?filename=gone.txt");
        let (status, bytes) =
            send(&app, request(Method::GET, &download, Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, data);

        std::fs::remove_file(&location).unwrap();
        let (status, _) =
            send(&app, request(Method::GET, &download, Some("alice"), Body::empty())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
