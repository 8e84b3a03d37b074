// src/utils/errors.rs

use reqwest;
use serde_json;
use std::{error::Error, fmt};
use tungstenite::Error as WsError;

/// Errors coming from external API calls (HTTP, JSON, WS, etc).
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    WebSocket(WsError),
    RateLimited,
    Other(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(e) => write!(f, "HTTP error: {}", e),
            ApiError::Json(e) => write!(f, "JSON error: {}", e),
            ApiError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            ApiError::RateLimited => write!(f, "Rate limited by vendor (HTTP 429)"),
            ApiError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Http(e) => Some(e),
            ApiError::Json(e) => Some(e),
            ApiError::WebSocket(e) => Some(e),
            ApiError::RateLimited => None,
            ApiError::Other(_) => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Json(err)
    }
}
impl From<WsError> for ApiError {
    fn from(err: WsError) -> Self {
        ApiError::WebSocket(err)
    }
}

/// Errors at the scan-pipeline level: wraps ApiError plus Bus and
/// Warehouse failures so the scan loop keeps a plain `?`.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("db: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

/// Maintenance task failures. A failed task never aborts the nightly
/// graph; the orchestrator records the message and moves on.
#[derive(thiserror::Error, Debug)]
pub enum MaintenanceError {
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("db: {0}")]
    Db(#[from] sqlx::Error),
    #[error("parquet: {0}")]
    Parquet(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<parquet::errors::ParquetError> for MaintenanceError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        MaintenanceError::Parquet(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for MaintenanceError {
    fn from(err: arrow::error::ArrowError) -> Self {
        MaintenanceError::Parquet(err.to_string())
    }
}
