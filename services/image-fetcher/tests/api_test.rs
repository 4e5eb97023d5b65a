use axum::http::{header, StatusCode};
use axum_test::TestServer;
use image_fetcher::api::{create_router, ApiState};
use serde_json::Value;
use shared::config::StorageConfig;
use shared::storage::memory::MemoryBackend;
use shared::storage::StorageClient;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn setup(root: &TempDir) -> (Arc<MemoryBackend>, TestServer) {
    let backend = MemoryBackend::new("images");
    backend.insert(
        "botany/originals/ab/12/ab12cd34ef.jpg",
        &b"0123456789"[..],
        Some("image/jpeg"),
    );

    let config = StorageConfig {
        endpoint: Some("memory://".to_string()),
        bucket: "images".to_string(),
        scratch_root: root.path().join("s3_temp"),
        chunk_size: 4,
        bucket_grace: Duration::from_millis(10),
        ..StorageConfig::default()
    };
    let client =
        StorageClient::with_factory(config, Some(backend.factory()), CancellationToken::new())
            .unwrap();

    let app = create_router(ApiState {
        client: Arc::new(client),
    });
    (backend, TestServer::new(app).unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let root = TempDir::new().unwrap();
    let (_backend, server) = setup(&root);

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "image-fetcher");
    assert_eq!(body["storage"], "enabled");
}

#[tokio::test]
async fn test_stream_original_inline() {
    let root = TempDir::new().unwrap();
    let (_backend, server) = setup(&root);

    let response = server.get("/originals/botany/ab12cd34ef.jpg").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.header(header::CONTENT_TYPE), "image/jpeg");
    assert_eq!(response.header(header::CONTENT_LENGTH), "10");
    assert_eq!(
        response.header(header::CONTENT_DISPOSITION),
        "inline; filename*=utf-8''ab12cd34ef.jpg"
    );
    assert_eq!(response.as_bytes().as_ref(), b"0123456789");
}

#[tokio::test]
async fn test_stream_original_as_download() {
    let root = TempDir::new().unwrap();
    let (_backend, server) = setup(&root);

    let response = server
        .get("/originals/botany/ab12cd34ef.jpg")
        .add_query_param("download", "specimen 1.jpg")
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.header(header::CONTENT_DISPOSITION),
        "attachment; filename*=utf-8''specimen%201.jpg"
    );
}

#[tokio::test]
async fn test_missing_original_is_404() {
    let root = TempDir::new().unwrap();
    let (_backend, server) = setup(&root);

    let response = server.get("/originals/botany/ff00aa11.jpg").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);

    let response = server.get("/url/botany/ff00aa11.jpg").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_short_filename_is_rejected() {
    let root = TempDir::new().unwrap();
    let (_backend, server) = setup(&root);

    let response = server.get("/originals/botany/ab1").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_presigned_url() {
    let root = TempDir::new().unwrap();
    let (_backend, server) = setup(&root);

    let response = server.get("/url/botany/ab12cd34ef.jpg").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let url = body["url"].as_str().unwrap();
    assert!(url.contains("X-Amz-Expires=3600"));
}
