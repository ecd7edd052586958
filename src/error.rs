use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessingError>;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parquet write error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid H3 resolution: {0}")]
    InvalidResolution(#[from] h3o::error::InvalidResolution),

    #[error("Invalid H3 cell index: {0}")]
    InvalidCell(#[from] h3o::error::InvalidCellIndex),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Output file {path} has header {found:?}, expected {expected:?}")]
    HeaderMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Resolution mismatch in source '{source_name}': expected {expected}, found {found}")]
    ResolutionMismatch {
        source_name: String,
        expected: u8,
        found: u8,
    },

    #[error("Checkpoint invariant violated: {0}")]
    CheckpointInvariant(String),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Illegal work unit transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

/// Provider failures, classified for the fetch loop's retry decisions.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Fatal(String),
}

impl SourceError {
    /// Map an HTTP status code onto the retry taxonomy.
    pub fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
        match status.as_u16() {
            429 => SourceError::RateLimited { retry_after: None },
            404 => SourceError::NotFound(url.to_string()),
            408 | 500..=599 => SourceError::Transient(format!("{} returned {}", url, status)),
            _ => SourceError::Fatal(format!("{} returned {}", url, status)),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return SourceError::from_status(status, &url);
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            SourceError::Transient(err.to_string())
        } else {
            SourceError::Fatal(err.to_string())
        }
    }
}
