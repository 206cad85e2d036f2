//! Axum router construction.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].  Admin routes sit behind the Bearer
//! token middleware; streaming and read-only routes are public.

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::auth;
use crate::errors::generate_request_id;
use crate::handlers::{files, health, objects, uploads};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Multipart framing allowance on top of the largest accepted file.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

// -- OpenAPI specification ----------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "chunkvault API",
        version = "0.1.0",
        description = "Byte-range file serving over chunked backend connections"
    ),
    paths(
        crate::handlers::health::health_check,
        crate::handlers::objects::get_object,
        crate::handlers::objects::head_object,
        crate::handlers::objects::download_object,
        crate::handlers::files::list_files,
        crate::handlers::files::delete_file,
        crate::handlers::files::stats,
        crate::handlers::files::backup,
        crate::handlers::files::restore,
        crate::handlers::uploads::upload_file,
        crate::handlers::uploads::ingest_url,
        crate::handlers::uploads::get_progress,
    ),
    components(schemas(
        crate::errors::ErrorBody,
        crate::metadata::store::FileRecord,
        crate::metadata::store::StoreStats,
        crate::media::MediaKind,
        crate::pool::ConnectionSnapshot,
        crate::progress::ProgressRecord,
        crate::progress::ProgressStatus,
        crate::ingest::IngestRequest,
        crate::handlers::health::HealthBody,
    )),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Objects", description = "Range streaming and downloads"),
        (name = "Files", description = "File records and maintenance"),
        (name = "Uploads", description = "Uploads, URL ingest and progress"),
    )
)]
struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the axum [`Router`] with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    let upload_limit = usize::try_from(
        state
            .uploader
            .max_file_size()
            .saturating_add(MULTIPART_OVERHEAD),
    )
    .unwrap_or(usize::MAX);

    let admin = Router::new()
        .route("/api/files/:id", delete(files::delete_file))
        .route(
            "/api/upload",
            post(uploads::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/download-url", post(uploads::ingest_url))
        .route("/api/stats", get(files::stats))
        .route("/api/backup", post(files::backup))
        .route("/api/restore", post(files::restore))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/", get(health::health_check))
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route(
            "/objects/:id",
            get(objects::get_object).head(objects::head_object),
        )
        .route("/objects/:id/download", get(objects::download_object))
        // Compatibility aliases.
        .route(
            "/api/stream/:id",
            get(objects::get_object).head(objects::head_object),
        )
        .route("/api/download/:id", get(objects::download_object))
        .route("/api/files", get(files::list_files))
        .route("/api/progress/:task_id", get(uploads::get_progress))
        .merge(admin)
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // The error renderer may already have set one.
    if !headers.contains_key("x-request-id") {
        if let Ok(v) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", v);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(v) = HeaderValue::from_str(&date) {
        headers.insert("date", v);
    }
    headers.insert("server", HeaderValue::from_static("chunkvault"));

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Fault, MemoryChunkBackend};
    use crate::backend::ChunkBackend;
    use crate::config::{Config, ConnectionClass, ConnectionConfig};
    use crate::media::MediaKind;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::metadata::store::{FileRecord, MetadataStore};
    use crate::pool::BackendPool;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::time::Duration;
    use tower::ServiceExt;

    const SIZE: usize = 3000;

    struct Harness {
        app: Router,
        state: Arc<AppState>,
        backend: Arc<MemoryChunkBackend>,
        dir: tempfile::TempDir,
    }

    fn content() -> Vec<u8> {
        (0..SIZE).map(|i| (i % 251) as u8).collect()
    }

    async fn harness() -> Harness {
        let backend = Arc::new(MemoryChunkBackend::new());
        backend.insert("obj1", content()).await;
        let dyn_backend: Arc<dyn ChunkBackend> = backend.clone();
        let cfg = ConnectionConfig {
            identity: "conn1".to_string(),
            class: ConnectionClass::Elevated,
            backend: "memory".to_string(),
            root_dir: String::new(),
            base_url: None,
            token: None,
        };
        let pool = BackendPool::initialize(vec![(cfg, dyn_backend)], 3)
            .await
            .unwrap();

        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        metadata
            .put_file(FileRecord {
                id: "file1".to_string(),
                owner_id: "u1".to_string(),
                display_name: "clip.mp4".to_string(),
                size_bytes: SIZE as u64,
                content_type: "video/mp4".to_string(),
                media_kind: MediaKind::Video {
                    duration_secs: 12,
                    supports_streaming: true,
                },
                remote_object_id: "obj1".to_string(),
                backend_identity: "conn1".to_string(),
                storage_channel: "default".to_string(),
                checksum: String::new(),
                uploaded_at: "2026-01-01T00:00:00.000Z".to_string(),
            })
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.streaming.chunk_size = 1024;
        config.auth.admin_password = "pw".to_string();
        config.uploads.temp_dir = dir.path().to_string_lossy().into_owned();

        let state = Arc::new(AppState::new(config, metadata, pool).unwrap());
        Harness {
            app: app(state.clone()),
            state,
            backend,
            dir,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn ranged(uri: &str, range: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("range", range)
            .body(Body::empty())
            .unwrap()
    }

    fn admin(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer pw")
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_has_common_headers() {
        let h = harness().await;
        let resp = h.app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["server"], "chunkvault");
        assert_eq!(resp.headers()["x-request-id"].len(), 16);
        assert!(resp.headers().contains_key("date"));
        let json = body_json(resp).await;
        assert_eq!(json["status"], "online");
        assert_eq!(json["connections"], 1);
    }

    #[tokio::test]
    async fn test_full_content() {
        let h = harness().await;
        let resp = h.app.oneshot(get("/objects/obj1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-length"], "3000");
        assert_eq!(resp.headers()["accept-ranges"], "bytes");
        assert_eq!(resp.headers()["content-type"], "video/mp4");
        assert_eq!(body_bytes(resp).await, content());
    }

    #[tokio::test]
    async fn test_partial_content_first_kib() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(ranged("/objects/obj1", "bytes=0-1023"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 0-1023/3000");
        assert_eq!(resp.headers()["content-length"], "1024");
        assert_eq!(body_bytes(resp).await, content()[..1024].to_vec());
    }

    #[tokio::test]
    async fn test_partial_content_spanning_chunks() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(ranged("/api/stream/obj1", "bytes=1000-2100"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 1000-2100/3000");
        assert_eq!(body_bytes(resp).await, content()[1000..=2100].to_vec());
    }

    #[tokio::test]
    async fn test_open_ended_range() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(ranged("/objects/obj1", "bytes=2500-"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 2500-2999/3000");
        assert_eq!(body_bytes(resp).await.len(), 500);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(ranged("/objects/obj1", "bytes=5000-"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()["content-range"], "bytes */3000");
        assert!(body_bytes(resp).await.is_empty());
        assert_eq!(h.backend.chunks_served(), 0);
    }

    #[tokio::test]
    async fn test_unknown_object_is_404() {
        let h = harness().await;
        let resp = h.app.oneshot(get("/objects/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "ObjectNotFound");
    }

    #[tokio::test]
    async fn test_head_matches_get_headers() {
        let h = harness().await;
        let req = Request::builder()
            .method("HEAD")
            .uri("/objects/obj1")
            .header("range", "bytes=0-99")
            .body(Body::empty())
            .unwrap();
        let resp = h.app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 0-99/3000");
        assert_eq!(resp.headers()["content-length"], "100");
        assert!(body_bytes(resp).await.is_empty());
        assert_eq!(h.backend.chunks_served(), 0);
    }

    #[tokio::test]
    async fn test_download_is_attachment() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(ranged("/api/download/obj1", "bytes=0-9"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp.headers()["content-disposition"].to_str().unwrap();
        assert!(disposition.starts_with("attachment;"));
        assert!(disposition.contains("clip.mp4"));
        assert_eq!(body_bytes(resp).await.len(), SIZE);
    }

    #[tokio::test]
    async fn test_rate_limited_stream_recovers() {
        let h = harness().await;
        h.backend.push_fault(Fault::RateLimitMidStream {
            after_chunks: 1,
            wait: Duration::from_millis(5),
        });
        let resp = h.app.oneshot(get("/objects/obj1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, content());
        assert_eq!(h.state.pool.snapshot()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let h = harness().await;
        let resp = h.app.clone().oneshot(get("/api/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["www-authenticate"], "Bearer");

        let resp = h
            .app
            .oneshot(admin("GET", "/api/stats", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["stats"]["total_files"], 1);
        assert_eq!(json["connections"][0]["identity"], "conn1");
        assert_eq!(json["default_connection"], "conn1");
    }

    #[tokio::test]
    async fn test_list_and_delete_files() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(get("/api/files?user_id=u1"))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["files"][0]["id"], "file1");

        let resp = h
            .app
            .clone()
            .oneshot(admin("DELETE", "/api/files/file1", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = h.app.clone().oneshot(get("/objects/obj1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = h
            .app
            .oneshot(admin("DELETE", "/api/files/file1", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(admin("POST", "/api/backup", Body::empty()))
            .await
            .unwrap();
        let json = body_json(resp).await;
        let backup = json["backup"].clone();
        assert_eq!(backup["files"][0]["id"], "file1");

        h.state.metadata.delete_file("file1").await.unwrap();
        let body = serde_json::json!({ "backup": backup }).to_string();
        let resp = h
            .app
            .clone()
            .oneshot(admin("POST", "/api/restore", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["imported"], 1);
        assert!(h.state.metadata.get_file("file1").await.unwrap().is_some());

        let resp = h
            .app
            .oneshot(admin("POST", "/api/restore", Body::from("{}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_progress_is_not_found_status() {
        let h = harness().await;
        let resp = h.app.oneshot(get("/api/progress/u1_missing")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["progress"]["status"], "not_found");
    }

    #[tokio::test]
    async fn test_multipart_upload_then_stream() {
        let h = harness().await;
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"user_id\"\r\n\r\nu5\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nhello over the pool\r\n--{b}--\r\n",
            b = boundary
        );
        let req = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header("authorization", "Bearer pw")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let resp = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["file_size"], 19);
        let task_id = json["task_id"].as_str().unwrap().to_string();
        assert!(task_id.starts_with("u5_"));

        let mut file_id = None;
        for _ in 0..400 {
            let resp = h
                .app
                .clone()
                .oneshot(get(&format!("/api/progress/{}", task_id)))
                .await
                .unwrap();
            let json = body_json(resp).await;
            if json["progress"]["status"] == "completed" {
                file_id = json["progress"]["file_id"].as_str().map(str::to_string);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let file_id = file_id.expect("upload did not complete");
        let record = h.state.metadata.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(record.owner_id, "u5");

        let resp = h
            .app
            .oneshot(get(&format!("/objects/{}", record.remote_object_id)))
            .await
            .unwrap();
        assert_eq!(body_bytes(resp).await, b"hello over the pool");
    }

    #[tokio::test]
    async fn test_upload_without_user_is_rejected() {
        let h = harness().await;
        let boundary = "B";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\r\nabc\r\n--{b}--\r\n",
            b = boundary
        );
        let req = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header("authorization", "Bearer pw")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let resp = h.app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        // The spooled file is removed.
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_openapi_document() {
        let h = harness().await;
        let resp = h.app.oneshot(get("/openapi.json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["paths"]["/objects/{id}"].is_object());
        assert!(json["paths"]["/api/upload"].is_object());
    }
}
