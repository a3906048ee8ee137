//! Axum REST API handlers

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::PipelineError;
use crate::service::types::{CroppedFaceReport, DetectionReport, RegisterReport};
use crate::service::FacePipeline;
use crate::storage::EmbeddingStore;

use super::dto::*;

/// Application state shared across handlers
pub struct AppState<S: EmbeddingStore> {
    pub pipeline: Arc<FacePipeline<S>>,
}

/// Create the REST API router
pub fn create_rest_router<S: EmbeddingStore + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/api/v1/detect", post(detect_handler::<S>))
        .route("/api/v1/embed", post(embed_handler::<S>))
        .route("/api/v1/register", post(register_handler::<S>))
        .route("/api/v1/persons", get(list_persons_handler::<S>))
        .route("/api/v1/persons/:id", put(upsert_person_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type ErrorReply = (StatusCode, Json<ErrorResponse>);

/// Map a pipeline outcome to its one fixed HTTP status and error code.
fn error_reply(err: PipelineError) -> ErrorReply {
    let (status, code) = match &err {
        PipelineError::InvalidImage(_) => (StatusCode::BAD_REQUEST, "INVALID_IMAGE"),
        PipelineError::NoFaceDetected => (StatusCode::UNPROCESSABLE_ENTITY, "NO_FACE_DETECTED"),
        PipelineError::ModelUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "MODEL_UNAVAILABLE")
        }
        PipelineError::EmbeddingDimensionMismatch { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "DIMENSION_MISMATCH")
        }
        PipelineError::DuplicateIdentity(_) => (StatusCode::CONFLICT, "DUPLICATE_IDENTITY"),
        PipelineError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        PipelineError::Inference(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INFERENCE_ERROR"),
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (status, Json(ErrorResponse::new(&err.to_string(), code)))
}

fn bad_request(message: &str, code: &str) -> ErrorReply {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message, code)))
}

/// Pull the image bytes and the optional flags out of a multipart form.
async fn read_image_form(
    multipart: &mut Multipart,
) -> Result<(Vec<u8>, bool, Option<i64>), ErrorReply> {
    let mut image_data: Option<Vec<u8>> = None;
    let mut include_attributes = false;
    let mut identity: Option<i64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&e.to_string(), "MULTIPART_ERROR"))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                image_data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| bad_request(&e.to_string(), "READ_ERROR"))?
                        .to_vec(),
                );
            }
            "include_attributes" => {
                let text = field.text().await.unwrap_or_default();
                include_attributes = text.parse().unwrap_or(false);
            }
            "identity" => {
                let text = field.text().await.unwrap_or_default();
                identity = text.parse().ok();
            }
            _ => {}
        }
    }

    let image_data =
        image_data.ok_or_else(|| bad_request("Missing image field", "MISSING_IMAGE"))?;
    Ok((image_data, include_attributes, identity))
}

/// Full-image mode: detect every face, embed each, optionally enrich.
async fn detect_handler<S: EmbeddingStore>(
    State(state): State<Arc<AppState<S>>>,
    mut multipart: Multipart,
) -> Result<Json<DetectionReport>, ErrorReply> {
    let (image_data, include_attributes, _) = read_image_form(&mut multipart).await?;

    let report = state
        .pipeline
        .extract_full(image_data, include_attributes)
        .await
        .map_err(error_reply)?;

    Ok(Json(report))
}

/// Cropped-face mode: the upload is one face filling the frame.
async fn embed_handler<S: EmbeddingStore>(
    State(state): State<Arc<AppState<S>>>,
    mut multipart: Multipart,
) -> Result<Json<CroppedFaceReport>, ErrorReply> {
    let (image_data, include_attributes, _) = read_image_form(&mut multipart).await?;

    let report = state
        .pipeline
        .extract_cropped(image_data, include_attributes)
        .await
        .map_err(error_reply)?;

    Ok(Json(report))
}

/// Register the most confident face under an identity key.
async fn register_handler<S: EmbeddingStore>(
    State(state): State<Arc<AppState<S>>>,
    mut multipart: Multipart,
) -> Result<Json<RegisterReport>, ErrorReply> {
    let (image_data, _, identity) = read_image_form(&mut multipart).await?;
    let identity =
        identity.ok_or_else(|| bad_request("Missing identity field", "MISSING_IDENTITY"))?;

    let report = state
        .pipeline
        .register(image_data, identity)
        .await
        .map_err(error_reply)?;

    Ok(Json(report))
}

/// Person catalog
async fn list_persons_handler<S: EmbeddingStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<PersonsResponse>, ErrorReply> {
    let entries = state.pipeline.list_identities().await.map_err(error_reply)?;

    Ok(Json(PersonsResponse {
        persons: entries
            .into_iter()
            .map(|p| PersonDto {
                id: p.id,
                name: p.name,
            })
            .collect(),
    }))
}

/// Create or rename a person entry
async fn upsert_person_handler<S: EmbeddingStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
    Json(request): Json<UpsertPersonRequest>,
) -> Result<Json<UpsertPersonResponse>, ErrorReply> {
    if request.name.trim().is_empty() {
        return Err(bad_request("Person name must not be empty", "MISSING_NAME"));
    }

    state
        .pipeline
        .upsert_person(id, request.name.trim())
        .await
        .map_err(error_reply)?;

    Ok(Json(UpsertPersonResponse { success: true, id }))
}

/// Health check
async fn health_handler<S: EmbeddingStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let models_loaded = state
        .pipeline
        .registry()
        .capabilities()
        .into_iter()
        .map(|(capability, bound)| (capability.as_str().to_string(), bound))
        .collect();

    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_loaded,
    })
}
