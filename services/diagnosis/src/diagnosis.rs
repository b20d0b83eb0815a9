//! Upload, classify, and record a diagnosis.
//!
//! [`DiagnosisService::diagnose`] runs one submitted image through the whole
//! flow: store connectivity check, staging on local disk, classification,
//! upload to the bucket, label resolution against the reference tables and
//! finally the history insert. The upload body is streamed straight into the
//! staged file. That file is removed exactly once on every path, including a
//! request dropped mid-flight, and no history row is written unless every
//! lookup succeeded.

use crate::error::ApiError;
use crate::object_storage::{allowed_extension, ImageStorage};
use crate::predictor::Predictor;
use crate::store::{DiagnosisStore, NewHistoryRecord};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Separator between plant and disease in classifier labels
pub const LABEL_SEPARATOR: &str = "___";

/// Name of an uploaded image that passed validation.
///
/// The content itself arrives separately as a chunk stream, so the name can
/// be checked before a single byte is read from the request.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    file_name: String,
}

impl ImageUpload {
    /// Validate the uploaded filename before anything touches disk or network
    pub fn new(file_name: Option<String>) -> Result<Self, ApiError> {
        let file_name = file_name
            .map(|name| sanitize_file_name(&name))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ApiError::Validation(
                    "Failed to upload image. Please attach an image file.".to_string(),
                )
            })?;

        if allowed_extension(&file_name).is_none() {
            warn!(file_name = %file_name, "Rejected upload with unsupported format");
            return Err(ApiError::Validation(
                "Unsupported file format. Only JPEG, JPG and PNG are supported.".to_string(),
            ));
        }

        Ok(Self { file_name })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Plant and disease names decoded from a classifier label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub plant: String,
    pub disease: String,
}

impl Label {
    /// Split `"{plant}___{disease}"`; both sides must be non-empty
    pub fn parse(label: &str) -> Result<Self, ApiError> {
        match label.trim().split_once(LABEL_SEPARATOR) {
            Some((plant, disease)) if !plant.is_empty() && !disease.is_empty() => Ok(Self {
                plant: plant.to_string(),
                disease: disease.to_string(),
            }),
            _ => Err(ApiError::NotFound(format!(
                "Prediction \"{}\" does not name a known plant and disease.",
                label
            ))),
        }
    }
}

/// Outcome of a successful diagnosis
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub history_id: String,
    pub plant_name: String,
    pub disease_name: String,
    pub solution: String,
    pub image_url: String,
}

/// Coordinates the store, the classifier and the bucket for one upload
pub struct DiagnosisService {
    store: Arc<dyn DiagnosisStore>,
    predictor: Arc<dyn Predictor>,
    storage: Arc<dyn ImageStorage>,
    staging_dir: PathBuf,
}

impl DiagnosisService {
    pub fn new(
        store: Arc<dyn DiagnosisStore>,
        predictor: Arc<dyn Predictor>,
        storage: Arc<dyn ImageStorage>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            predictor,
            storage,
            staging_dir: staging_dir.into(),
        }
    }

    /// Run one upload through classification and record it in history.
    ///
    /// `body` yields the image content. An error item aborts staging and is
    /// returned unchanged.
    #[instrument(skip(self, upload, body), fields(file_name = %upload.file_name))]
    pub async fn diagnose<S>(&self, upload: ImageUpload, body: S) -> Result<Diagnosis, ApiError>
    where
        S: Stream<Item = Result<Bytes, ApiError>> + Send,
    {
        let result = self.run(&upload, body).await;

        match &result {
            Ok(diagnosis) => {
                metrics::counter!("diagnosis.predictions.succeeded").increment(1);
                info!(
                    history_id = %diagnosis.history_id,
                    plant = %diagnosis.plant_name,
                    disease = %diagnosis.disease_name,
                    "Diagnosis recorded"
                );
            }
            Err(e) => {
                metrics::counter!("diagnosis.predictions.failed").increment(1);
                error!(error = %e, "Diagnosis failed");
            }
        }

        result
    }

    async fn run<S>(&self, upload: &ImageUpload, body: S) -> Result<Diagnosis, ApiError>
    where
        S: Stream<Item = Result<Bytes, ApiError>> + Send,
    {
        self.store.ping().await.map_err(|e| {
            error!(error = %e, "Database connection lost");
            ApiError::Dependency("Database connection failed.".to_string())
        })?;

        let staged = StagedFile::write(&self.staging_dir, upload.file_name(), body).await?;
        let result = self.classify_and_record(staged.path(), upload.file_name()).await;
        staged.remove().await;

        result
    }

    async fn classify_and_record(
        &self,
        staged_path: &Path,
        file_name: &str,
    ) -> Result<Diagnosis, ApiError> {
        let label = self.predictor.predict(staged_path).await.map_err(|e| {
            error!(error = %e, "Classifier failed");
            ApiError::Dependency("Failed to classify image.".to_string())
        })?;

        let image_url = self
            .storage
            .upload(staged_path, file_name)
            .await
            .map_err(|e| {
                error!(error = ?e, "Image upload failed");
                ApiError::Dependency(e.to_string())
            })?;
        info!(image_url = %image_url, "Image stored");

        let Label { plant, disease } = Label::parse(&label)?;

        let plant_id = self
            .store
            .find_plant_id(&plant)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| ApiError::NotFound(format!("Plant \"{}\" was not found.", plant)))?;

        let disease_id = self
            .store
            .find_disease_id(&disease, plant_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "Disease \"{}\" for plant \"{}\" was not found.",
                    disease, plant
                ))
            })?;

        let solution = self
            .store
            .find_solution(disease_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "Solution for disease \"{}\" was not found.",
                    disease
                ))
            })?;

        let record = NewHistoryRecord {
            id: new_history_id(),
            date: today(),
            plant_id,
            disease_id,
            solution_id: solution.id,
            image_url: image_url.clone(),
        };

        self.store
            .insert_history(&record)
            .await
            .map_err(store_failure)?;

        Ok(Diagnosis {
            history_id: record.id,
            plant_name: plant,
            disease_name: disease,
            solution: solution.description,
            image_url,
        })
    }
}

/// Local copy of an upload.
///
/// [`StagedFile::remove`] is the normal way out. A staged file dropped
/// without it, because the request future was cancelled, is deleted
/// synchronously in `Drop`.
struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    /// Stream `body` into a per-request file inside `dir`
    async fn write<S>(dir: &Path, file_name: &str, body: S) -> Result<Self, ApiError>
    where
        S: Stream<Item = Result<Bytes, ApiError>>,
    {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            error!(error = %e, dir = %dir.display(), "Failed to create staging directory");
            ApiError::Internal("Failed to process image.".to_string())
        })?;

        let staged = Self {
            path: dir.join(format!("{}-{}", Uuid::new_v4().simple(), file_name)),
            armed: true,
        };

        match copy_body(&staged.path, body).await {
            Ok(written) => {
                debug!(path = %staged.path.display(), bytes = written, "Upload staged");
                Ok(staged)
            }
            Err(e) => {
                staged.remove().await;
                Err(e)
            }
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        let result = tokio::fs::remove_file(&self.path).await;
        self.armed = false;

        match result {
            Ok(()) => info!(path = %self.path.display(), "Staged file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "Failed to remove staged file"),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => warn!(path = %self.path.display(), "Removed staged file of abandoned request"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "Failed to remove staged file"),
        }
    }
}

async fn copy_body<S>(path: &Path, body: S) -> Result<u64, ApiError>
where
    S: Stream<Item = Result<Bytes, ApiError>>,
{
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| staging_failure(path, e))?;

    let mut body = std::pin::pin!(body);
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| staging_failure(path, e))?;
        written += chunk.len() as u64;
    }

    // tokio finishes the last write in the background unless flushed
    file.flush().await.map_err(|e| staging_failure(path, e))?;

    Ok(written)
}

fn staging_failure(path: &Path, e: std::io::Error) -> ApiError {
    error!(error = %e, path = %path.display(), "Failed to stage upload");
    ApiError::Internal("Failed to process image.".to_string())
}

fn store_failure(e: anyhow::Error) -> ApiError {
    error!(error = %e, "Store query failed");
    ApiError::Dependency("Failed to process image.".to_string())
}

/// URL-safe 22 character token
fn new_history_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Keep the basename and replace anything outside `[A-Za-z0-9._-]`
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    base.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
