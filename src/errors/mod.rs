//! Error handling for the Cometa store.
//!
//! One error type covers storage, backup and HTTP failures. Integrity errors always
//! reach the caller; permission and transient errors are absorbed by the background
//! components that hit them and only logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNKNOWN_TABLE: &str = "UNKNOWN_TABLE";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const INTEGRITY_ERROR: &str = "INTEGRITY_ERROR";
    pub const UNSUPPORTED_SCHEMA: &str = "UNSUPPORTED_SCHEMA";
    pub const MAINTENANCE: &str = "MAINTENANCE";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    /// Authentication required
    Unauthorized(String),
    /// Record or resource not found
    NotFound(String),
    /// Table name is not part of the schema
    UnknownTable(String),
    /// Validation error
    Validation(String),
    /// No backup destination, or the host refused access to it
    Permission(String),
    /// A backup file does not match its manifest
    Integrity { path: String, message: String },
    /// Backup written by a schema this build cannot read
    UnsupportedSchema { found: i64, supported: i64 },
    /// A restore currently holds the maintenance flag
    Maintenance(String),
    /// Structured backend error
    Database(String),
    /// File or directory error
    Io(String),
    /// Internal error
    Internal(String),
    /// Bad request
    BadRequest(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnknownTable(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Permission(_) => StatusCode::FORBIDDEN,
            AppError::Integrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::UnsupportedSchema { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Maintenance(_) => StatusCode::CONFLICT,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::UnknownTable(_) => codes::UNKNOWN_TABLE,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Permission(_) => codes::PERMISSION_DENIED,
            AppError::Integrity { .. } => codes::INTEGRITY_ERROR,
            AppError::UnsupportedSchema { .. } => codes::UNSUPPORTED_SCHEMA,
            AppError::Maintenance(_) => codes::MAINTENANCE,
            AppError::Database(_) => codes::DATABASE_ERROR,
            AppError::Io(_) => codes::IO_ERROR,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
            AppError::BadRequest(_) => codes::BAD_REQUEST,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Unauthorized(msg) => msg.clone(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::UnknownTable(table) => format!("Table {} is not part of the schema", table),
            AppError::Validation(msg) => msg.clone(),
            AppError::Permission(msg) => msg.clone(),
            AppError::Integrity { path, message } => format!("{}: {}", path, message),
            AppError::UnsupportedSchema { found, supported } => format!(
                "Backup schema version {} is not supported (this build reads up to {})",
                found, supported
            ),
            AppError::Maintenance(msg) => msg.clone(),
            AppError::Database(msg) => msg.clone(),
            AppError::Io(msg) => msg.clone(),
            AppError::Internal(msg) => msg.clone(),
            AppError::BadRequest(msg) => msg.clone(),
        }
    }

    /// Integrity failures abort an import and must never be downgraded.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            AppError::Integrity { .. } | AppError::UnsupportedSchema { .. }
        )
    }

    pub fn integrity(path: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Integrity {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::Database(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return AppError::NotFound(format!("File not found: {}", err));
        }
        AppError::Io(format!("I/O error: {}", err))
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::BadRequest(format!("Invalid base64 payload: {}", err))
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
}

impl ErrorResponse {
    pub fn new(error: &AppError) -> Self {
        let details = match error {
            AppError::Integrity { path, .. } => Some(serde_json::json!({ "path": path })),
            AppError::UnsupportedSchema { found, supported } => {
                Some(serde_json::json!({ "found": found, "supported": supported }))
            }
            _ => None,
        };

        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
                details,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), "{}", self.message());
        }
        (status, Json(ErrorResponse::new(&self))).into_response()
    }
}

/// Result type alias for store and backup operations.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_errors_are_flagged() {
        assert!(AppError::integrity("users.json", "digest mismatch").is_integrity());
        assert!(AppError::UnsupportedSchema {
            found: 9,
            supported: 1
        }
        .is_integrity());
        assert!(!AppError::Permission("no destination".into()).is_integrity());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Maintenance("restore running".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::integrity("a", "b").status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::UnknownTable("nope".into()).error_code(),
            codes::UNKNOWN_TABLE
        );
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_error_envelope_carries_path() {
        let body = ErrorResponse::new(&AppError::integrity("photos/a.jpg", "digest mismatch"));
        assert!(!body.success);
        assert_eq!(body.error.code, codes::INTEGRITY_ERROR);
        assert_eq!(body.error.details.unwrap()["path"], "photos/a.jpg");
    }
}
