use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use hyperreal_core::{
    Configuration, GenerationDefaults, GenerationRequest, GenerationResult, OrchestratorError,
    OrchestratorHandle, DEFAULT_STYLE,
};
use image::DynamicImage;
use serde::Serialize;
use tracing::{error, warn};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub handle: OrchestratorHandle,
    pub config: Arc<Configuration>,
    pub output_dir: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/styles", get(styles_handler))
        .route("/v1/archives/{name}", get(archive_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct GenerationResponse {
    /// Base64-encoded PNGs, in seed order.
    images: Vec<String>,
    seeds: Vec<i64>,
    elapsed_secs: f64,
    info_text: String,
    batch_id: String,
    /// Download URL of the batch archive.
    archive: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    completed: usize,
}

#[derive(Serialize)]
struct StylesResponse {
    styles: Vec<String>,
    default_style: &'static str,
    defaults: GenerationDefaults,
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn to_response(result: GenerationResult) -> Result<GenerationResponse> {
    let images = result
        .images
        .iter()
        .map(image_to_base64_png)
        .collect::<Result<Vec<_>>>()?;
    let archive = result
        .archive
        .as_ref()
        .and_then(|path| path.file_name())
        .map(|name| format!("/v1/archives/{}", name.to_string_lossy()));
    Ok(GenerationResponse {
        images,
        seeds: result.seeds.as_slice().to_vec(),
        elapsed_secs: result.elapsed.as_secs_f64(),
        info_text: result.info_text(),
        batch_id: result.batch_id,
        archive,
    })
}

fn error_response(err: &OrchestratorError) -> Response {
    let status = match err {
        OrchestratorError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error: err.to_string(),
        completed: err.completed(),
    };
    (status, Json(body)).into_response()
}

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Response {
    // Dropping this future (client gone) cancels the request if it is still queued.
    match state.handle.generate(req).await {
        Ok(result) => match to_response(result) {
            Ok(body) => Json(body).into_response(),
            Err(e) => {
                error!("Error encoding images: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
            }
        },
        Err(e) => {
            warn!("Generation failed: {e}");
            error_response(&e)
        }
    }
}

async fn styles_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StylesResponse {
        styles: state.config.styles.keys().cloned().collect(),
        default_style: DEFAULT_STYLE,
        defaults: state.config.generation.defaults,
    })
}

/// Only plain `batch_*.zip` names from the output directory are served.
fn is_archive_name(name: &str) -> bool {
    name.starts_with("batch_")
        && name.ends_with(".zip")
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

async fn archive_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if !is_archive_name(&name) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match tokio::fs::read(state.output_dir.join(&name)).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Error reading archive {name}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
