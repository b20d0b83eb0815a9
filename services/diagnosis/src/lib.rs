//! PlantLens Diagnosis Service
//!
//! Backend for the PlantLens app. A client uploads a photo of a leaf, the
//! service runs the plant disease classifier on it, stores the photo in an
//! object storage bucket, resolves the predicted plant and disease against the
//! reference tables in MySQL, and records the diagnosis in the history table.
//!
//! ## Endpoints
//!
//! - `POST /predict`: multipart upload (field `file`, JPEG/JPG/PNG)
//! - `GET /plants/:id`: plant name and description
//! - `GET /disease-solutions`: every plant/disease/solution combination
//! - `GET /history`: recorded diagnoses, newest first
//! - `GET /health`, `GET /ready`: liveness and database readiness
//!
//! ## Flow
//!
//! ```text
//!   POST /predict
//!        │
//!        ▼
//! ┌──────────────┐   SELECT 1   ┌──────────────┐
//! │ Diagnosis    │─────────────▶│ MySQL        │
//! │ Service      │              │ tanaman      │
//! └──────────────┘              │ penyakit     │
//!   │    │    │                 │ solusi       │
//!   │    │    │  lookups +      │ history      │
//!   │    │    └────────────────▶└──────────────┘
//!   │    │          insert
//!   │    ▼
//!   │  ┌──────────────┐        ┌──────────────┐
//!   │  │ Classifier   │        │ Bucket       │
//!   │  │ process      │        │ {ms}-{name}  │
//!   │  └──────────────┘        └──────────────┘
//!   │                                 ▲
//!   └─────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod object_storage;
pub mod predictor;
pub mod store;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use diagnosis::{Diagnosis, DiagnosisService, ImageUpload, Label};
pub use error::ApiError;
pub use object_storage::{ImageStorage, S3ImageStorage, StorageError};
pub use predictor::{PredictError, Predictor, ProcessPredictor};
pub use store::{DiagnosisStore, MySqlStore};
