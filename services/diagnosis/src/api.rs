use crate::config::ApiConfig;
use crate::diagnosis::{Diagnosis, DiagnosisService, ImageUpload};
use crate::error::ApiError;
use crate::store::{DiagnosisStore, DiseaseSolution, HistoryEntry, Plant};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, NaiveDate};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DiagnosisStore>,
    pub diagnosis: Arc<DiagnosisService>,
}

/// Successful prediction response
#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub data: PredictionData,
}

#[derive(Debug, Serialize)]
pub struct PredictionData {
    #[serde(rename = "nama_tanaman")]
    pub plant_name: String,
    #[serde(rename = "nama_penyakit")]
    pub disease_name: String,
    #[serde(rename = "penanganan")]
    pub solution: String,
}

impl From<Diagnosis> for PredictionData {
    fn from(d: Diagnosis) -> Self {
        Self {
            plant_name: d.plant_name,
            disease_name: d.disease_name,
            solution: d.solution,
        }
    }
}

/// History listing response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub status: &'static str,
    pub data: Vec<HistoryItem>,
}

/// History row as shown to the app
#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub id_history: String,
    pub nama_tanaman: String,
    pub nama_penyakit: String,
    pub desc_solusi: String,
    pub image: String,
    pub tgl_history: String,
}

impl From<HistoryEntry> for HistoryItem {
    fn from(h: HistoryEntry) -> Self {
        Self {
            id_history: h.id,
            nama_tanaman: h.plant_name,
            nama_penyakit: h.disease_name,
            desc_solusi: h.solution,
            image: h.image_url,
            tgl_history: display_date(h.date),
        }
    }
}

/// Indonesian short date, `d/m/yyyy` without padding
fn display_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.day(), date.month(), date.year())
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/plants/:id_tanaman", get(get_plant))
        .route("/disease-solutions", get(list_disease_solutions))
        .route("/history", get(list_history))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "diagnosis-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            error!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected"
                })),
            )
        }
    }
}

/// Connectivity check shared by the read endpoints
async fn ensure_connected(state: &AppState, failure: &'static str) -> Result<(), ApiError> {
    state.store.ping().await.map_err(|e| {
        error!(error = %e, "Database connection lost");
        ApiError::Dependency(failure.to_string())
    })
}

/// Get a plant by id
#[instrument(skip(state))]
async fn get_plant(
    State(state): State<AppState>,
    Path(id_tanaman): Path<String>,
) -> Result<Json<Plant>, ApiError> {
    const FAILURE: &str = "Failed to fetch plant data.";

    ensure_connected(&state, FAILURE).await?;

    // Ids that cannot be a row key are simply absent
    let Ok(plant_id) = id_tanaman.trim().parse::<i32>() else {
        return Err(ApiError::NotFound("Plant not found.".to_string()));
    };

    let plant = state.store.get_plant(plant_id).await.map_err(|e| {
        error!(error = %e, plant_id, "Failed to get plant");
        ApiError::Dependency(FAILURE.to_string())
    })?;

    plant
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Plant not found.".to_string()))
}

/// Every plant/disease/solution combination
#[instrument(skip(state))]
async fn list_disease_solutions(
    State(state): State<AppState>,
) -> Result<Json<Vec<DiseaseSolution>>, ApiError> {
    const FAILURE: &str = "Failed to fetch disease solutions.";

    ensure_connected(&state, FAILURE).await?;

    let rows = state.store.list_disease_solutions().await.map_err(|e| {
        error!(error = %e, "Failed to list disease solutions");
        ApiError::Dependency(FAILURE.to_string())
    })?;

    Ok(Json(rows))
}

/// Diagnosis history, newest first
#[instrument(skip(state))]
async fn list_history(State(state): State<AppState>) -> Result<Json<HistoryResponse>, ApiError> {
    const FAILURE: &str = "Failed to fetch history.";

    ensure_connected(&state, FAILURE).await?;

    let rows = state.store.list_history().await.map_err(|e| {
        error!(error = %e, "Failed to list history");
        ApiError::Dependency(FAILURE.to_string())
    })?;

    Ok(Json(HistoryResponse {
        status: "success",
        data: rows.into_iter().map(HistoryItem::from).collect(),
    }))
}

/// Classify an uploaded image and record the diagnosis
#[instrument(skip(state, multipart))]
async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResponse>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(upload_read_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let upload = ImageUpload::new(field.file_name().map(str::to_owned))?;
        let body = field.map(|chunk| chunk.map_err(upload_read_error));

        let diagnosis = state.diagnosis.diagnose(upload, body).await?;

        return Ok(Json(PredictionResponse {
            status: "success",
            message: "Image diagnosed and uploaded.",
            data: diagnosis.into(),
        }));
    }

    Err(ApiError::Validation(
        "Failed to upload image. Please attach an image file.".to_string(),
    ))
}

/// Body limit overruns become 413, anything else is a malformed upload
fn upload_read_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(error = %e, "Upload exceeds body limit");
        ApiError::PayloadTooLarge("Failed to upload image. The file is too large.".to_string())
    } else {
        error!(error = %e, "Malformed multipart body");
        ApiError::Validation("Failed to read upload.".to_string())
    }
}

/// Start the API server and serve until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting diagnosis API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
