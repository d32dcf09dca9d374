use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use super::state::ServiceContext;
use crate::{error::ServiceError, inference::Prediction};

/// Field names accepted for the uploaded image.
const UPLOAD_FIELDS: [&str; 2] = ["image", "file"];

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::ServiceUnavailable | ServiceError::Timeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match self {
            ServiceError::Internal(details) => {
                error!("Prediction failed: {}", details);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /health
async fn health(State(ctx): State<ServiceContext>) -> Json<HealthResponse> {
    let status = if ctx.is_ready() { "ready" } else { "loading" };
    Json(HealthResponse { status })
}

/// POST /predict - multipart upload of one image
async fn predict(
    State(ctx): State<ServiceContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ServiceError> {
    let pool = ctx.pool().ok_or(ServiceError::ServiceUnavailable)?;
    let multipart = multipart
        .map_err(|err| ServiceError::BadRequest(format!("Expected a multipart upload: {err}")))?;

    let image = read_upload(multipart, ctx.config().max_upload_bytes).await?;
    debug!("Received image of {} bytes", image.len());

    let prediction = tokio::time::timeout(ctx.config().request_timeout(), pool.predict(image))
        .await
        .map_err(|_| ServiceError::Timeout)??;

    Ok(Json(prediction))
}

/// The `image` or `file` field, or else the first field carrying a file name.
async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<Vec<u8>, ServiceError> {
    let invalid = |err: MultipartError| match err.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ServiceError::PayloadTooLarge(limit),
        _ => ServiceError::BadRequest(format!("Invalid multipart body: {err}")),
    };

    let mut fallback = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let named = field
            .name()
            .is_some_and(|name| UPLOAD_FIELDS.contains(&name));
        let has_file_name = field.file_name().is_some();

        if named || (has_file_name && fallback.is_none()) {
            let bytes = field.bytes().await.map_err(invalid)?;
            if named {
                fallback = Some(bytes);
                break;
            }
            fallback = Some(bytes);
        }
    }

    match fallback {
        Some(bytes) if !bytes.is_empty() => Ok(bytes.to_vec()),
        Some(_) => Err(ServiceError::BadRequest("Uploaded file is empty".to_string())),
        None => Err(ServiceError::BadRequest(
            "No image in the request, expected a multipart field named `image`".to_string(),
        )),
    }
}

/// HTTP interface of the classifier.
pub fn router(ctx: ServiceContext) -> Router {
    let body_limit = ctx.config().max_upload_bytes;

    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
