use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration for the diagnosis service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Classifier process configuration
    #[serde(default)]
    pub predictor: PredictorConfig,
    /// Local staging area for uploads
    #[serde(default)]
    pub staging: StagingConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// MySQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default)]
    pub run_migrations: bool,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding diagnosis images
    pub bucket: String,
    /// Region passed to the S3 client
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (GCS interoperability, MinIO, LocalStack)
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Host used to build public object URLs
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Shared credentials file for the storage service account
    pub credentials_file: Option<PathBuf>,
}

/// External classifier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Program to run
    #[serde(default = "default_predictor_program")]
    pub program: String,
    /// Arguments placed before the image path
    #[serde(default = "default_predictor_args")]
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
}

/// Staging directory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Directory where uploads are written before classification
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "diagnosis-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_endpoint_url() -> Option<String> {
    Some("https://storage.googleapis.com".to_string())
}

fn default_public_host() -> String {
    "storage.googleapis.com".to_string()
}

fn default_predictor_program() -> String {
    "python3".to_string()
}

fn default_predictor_args() -> Vec<String> {
    vec!["./src/predict.py".to_string()]
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9000
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "diagnosis-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/diagnosis").required(false))
            .add_source(config::File::with_name("/etc/plantlens/diagnosis").required(false))
            // Override with environment variables
            // DIAGNOSIS__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("DIAGNOSIS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            program: default_predictor_program(),
            args: default_predictor_args(),
            working_dir: None,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_api_port(), 9000);
        assert_eq!(default_max_upload_bytes(), 10 * 1024 * 1024);
        assert_eq!(default_public_host(), "storage.googleapis.com");
    }

    #[test]
    fn test_predictor_defaults_run_python_script() {
        let predictor = PredictorConfig::default();
        assert_eq!(predictor.program, "python3");
        assert_eq!(predictor.args, vec!["./src/predict.py".to_string()]);
        assert!(predictor.working_dir.is_none());
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = config::Config::builder()
            .set_default("service.name", "diagnosis-service")
            .unwrap()
            .set_override("database.url", "mysql://root@localhost/plantlens")
            .unwrap()
            .set_override("storage.bucket", "history-image1")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database.max_connections, 10);
        assert!(!config.database.run_migrations);
        assert_eq!(config.storage.bucket, "history-image1");
        assert_eq!(
            config.storage.endpoint_url.as_deref(),
            Some("https://storage.googleapis.com")
        );
        assert_eq!(config.staging.dir, PathBuf::from("uploads"));
        assert!(config.api.cors_enabled);
    }
}
