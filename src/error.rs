use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the settlement core
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Chain adapter errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC call failed on {network}: {message}")]
    Rpc { network: String, message: String },

    #[error("Failed to decode {what} on {network}: {message}")]
    Decode {
        network: String,
        what: &'static str,
        message: String,
    },

    #[error("Network not registered: {0}")]
    UnknownNetwork(String),
}

/// Provider assignment errors
#[derive(Error, Debug)]
pub enum AssignmentError {
    #[error("No providers available in bucket {bucket_id}")]
    NoProvidersAvailable { bucket_id: Uuid },

    #[error("Lock order {0} has no provision bucket")]
    NoProvisionBucket(Uuid),

    #[error("Provider {0} not found")]
    ProviderNotFound(String),

    #[error("Provider {provider_id} has no rate configured for {token}")]
    NoProviderRate { provider_id: String, token: String },
}

/// Order lifecycle errors
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Order {id} in invalid state: {current}, expected: {expected}")]
    InvalidState {
        id: Uuid,
        current: String,
        expected: String,
    },

    #[error("Missing reference: {0}")]
    MissingReference(String),

    #[error("Recipient metadata could not be decoded: {0}")]
    InvalidRecipient(String),

    #[error("Lifecycle call {action} failed: {message}")]
    Lifecycle {
        action: &'static str,
        message: String,
    },
}

impl AppError {
    /// Infrastructure failures that a bounded retry may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::RowNotFound) => false,
            AppError::Database(_) => true,
            AppError::Chain(ChainError::Rpc { .. }) => true,
            AppError::Cache(_) => true,
            AppError::ExternalError(_) => true,
            _ => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message,
                None,
            ),
            AppError::Assignment(AssignmentError::NoProvidersAvailable { bucket_id }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_PROVIDERS_AVAILABLE",
                format!("No providers available in bucket {}", bucket_id),
                Some(serde_json::json!({ "bucket_id": bucket_id })),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON error: {:?}", error))
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(error: base64::DecodeError) -> Self {
        AppError::InvalidInput(format!("Base64 decode error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
