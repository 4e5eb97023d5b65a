use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use shared::keys::{KeyError, ShardedKey};
use shared::storage::{StorageClient, StorageError};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Clone)]
pub struct ApiState {
    pub client: Arc<StorageClient>,
}

#[derive(Debug, Deserialize)]
pub struct OriginalQuery {
    pub download: Option<String>,
}

pub enum ApiError {
    BadKey(KeyError),
    Storage(StorageError),
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        ApiError::BadKey(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadKey(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Storage(StorageError::NotFound(key)) => {
                warn!(key = %key, "requested original not found");
                (StatusCode::NOT_FOUND, format!("Not found: {}", key))
            }
            ApiError::Storage(e) => {
                error!(error = %e, "storage request failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/originals/:collection/:filename", get(stream_original))
        .route("/url/:collection/:filename", get(original_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "image-fetcher",
        "storage": if state.client.is_enabled() { "enabled" } else { "disabled" },
    }))
}

async fn stream_original(
    State(state): State<ApiState>,
    Path((collection, filename)): Path<(String, String)>,
    Query(query): Query<OriginalQuery>,
) -> Result<Response, ApiError> {
    let key = ShardedKey::new(&collection, &filename)?;
    let response = state
        .client
        .stream_response(&key.relative_key(), query.download.as_deref())
        .await?;
    Ok(response)
}

async fn original_url(
    State(state): State<ApiState>,
    Path((collection, filename)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = ShardedKey::new(&collection, &filename)?;
    let rel = key.relative_key();
    state.client.orig_location(&rel).await?;
    let url = state.client.presigned_url(&rel).await?;
    Ok(Json(json!({ "url": url })))
}
