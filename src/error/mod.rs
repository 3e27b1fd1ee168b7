use serde::Serialize;
use thiserror::Error;

/// Top-level error for anything the server does
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Cascade error: {0}")]
    Cascade(#[from] CascadeError),

    #[error("Save failed: {0}")]
    Save(#[from] SaveError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Parameter set not found: {id}")]
    DefinitionNotFound { id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Query backend (HTTP) errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BackendError {
    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Api { status, .. } => *status >= 500,
            BackendError::InvalidResponse { .. } => false,
            _ => true,
        }
    }
}

/// Errors raised while resolving or mutating a parameter set
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CascadeError {
    #[error("Cyclic parameter dependency: {path}")]
    CyclicDependency { path: String },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Parameter index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Duplicate parameter name: {name}")]
    DuplicateName { name: String },
}

/// Errors raised when persisting a parameter set or dashboard definition
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("{resource} has been modified by another user")]
    Conflict { resource: String },

    #[error("Permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Parameter value validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("The following parameter values are incompatible with their definitions: {}", names.join(", "))]
    InvalidParameters { names: Vec<String> },
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Severity of a user-visible notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Error,
    Warning,
}

/// User-visible notification produced from a failed save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    /// Stays on screen until dismissed.
    pub sticky: bool,
}

impl SaveError {
    /// Map the failure to the notification the user should see.
    ///
    /// In-memory state is never touched here; the user decides whether to
    /// retry or reload.
    pub fn notification(&self) -> Notification {
        match self {
            SaveError::PermissionDenied => Notification {
                level: NotificationLevel::Error,
                title: "Update failed".to_string(),
                message: "Permission Denied.".to_string(),
                sticky: false,
            },
            SaveError::Conflict { resource } => Notification {
                level: NotificationLevel::Error,
                title: format!("It seems like the {} has been modified by another user.", resource),
                message: "Please copy/backup your changes and reload this page.".to_string(),
                sticky: true,
            },
            other => Notification {
                level: NotificationLevel::Warning,
                title: "Update failed".to_string(),
                message: other.to_string(),
                sticky: false,
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type alias for cascade operations
pub type CascadeResult<T> = Result<T, CascadeError>;

/// Result type alias for save operations
pub type SaveResult<T> = Result<T, SaveError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "BACKEND_BASE_URL must be http(s)".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: BACKEND_BASE_URL must be http(s)");

        let err: AppError = CascadeError::UnknownParameter {
            name: "region".to_string(),
        }
        .into();
        assert!(err.to_string().starts_with("Cascade error:"));
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::DefinitionNotFound {
            id: "sales".to_string(),
        };
        assert_eq!(err.to_string(), "Parameter set not found: sales");

        let err = StorageError::Serialization {
            message: "bad parameters column".to_string(),
        };
        assert_eq!(err.to_string(), "Serialization failed: bad parameters column");
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Unavailable {
            message: "server down".to_string(),
            retries: 3,
        };
        assert_eq!(err.to_string(), "Backend unavailable: server down (retries: 3)");

        let err = BackendError::Api {
            status: 404,
            message: "not found".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 404 - not found");

        let err = BackendError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_backend_error_retryable() {
        assert!(BackendError::Api {
            status: 502,
            message: String::new()
        }
        .is_retryable());
        assert!(!BackendError::Api {
            status: 403,
            message: String::new()
        }
        .is_retryable());
        assert!(BackendError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!BackendError::InvalidResponse {
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_cascade_error_display() {
        let err = CascadeError::CyclicDependency {
            path: "a -> b -> a".to_string(),
        };
        assert_eq!(err.to_string(), "Cyclic parameter dependency: a -> b -> a");

        let err = CascadeError::IndexOutOfRange { index: 4, len: 2 };
        assert_eq!(err.to_string(), "Parameter index 4 out of range (len 2)");
    }

    #[test]
    fn test_validation_error_lists_names() {
        let err = ValidationError::InvalidParameters {
            names: vec!["region".to_string(), "year".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "The following parameter values are incompatible with their definitions: region, year"
        );
    }

    #[test]
    fn test_save_error_notifications() {
        let denied = SaveError::PermissionDenied.notification();
        assert_eq!(denied.message, "Permission Denied.");
        assert!(!denied.sticky);

        let conflict = SaveError::Conflict {
            resource: "dashboard".to_string(),
        }
        .notification();
        assert!(conflict.title.contains("modified by another user"));
        assert!(conflict.sticky);
        assert_ne!(denied, conflict);
    }

    #[test]
    fn test_app_error_becomes_tool_failure() {
        let mcp_err: McpError = AppError::from(StorageError::DefinitionNotFound {
            id: "sales".to_string(),
        })
        .into();
        assert!(matches!(mcp_err, McpError::ExecutionFailed { .. }));
        assert!(mcp_err.to_string().contains("Parameter set not found: sales"));
    }

    #[test]
    fn test_cascade_error_conversion_to_app_error() {
        let err = CascadeError::UnknownParameter {
            name: "city".to_string(),
        };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Cascade(_)));
    }
}
