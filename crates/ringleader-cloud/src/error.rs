//! Cloud provider error types

use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("no machine image found in {region} matching '{pattern}'")]
    ImageNotFound { region: String, pattern: String },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("provider API error: {0}")]
    ApiError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;
