use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Referenced entity does not exist (or is soft-deleted).
    NotFound(String),
    /// Business-rule violation (duplicate active appointment, full timeslot, ...).
    Conflict(String),
    /// Malformed or incomplete input.
    Validation(String),
    /// Error interacting with an external API (dialer, webhook receiver).
    ExternalApiError(String),
    /// Internal server error.
    InternalError(String),
    /// Missing actor or bad shared secret.
    Unauthorized(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// The innermost error, with every context layer peeled off.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status for this error.
    ///
    /// Business failures (conflicts, validation) are reported as 400 so that
    /// forms can surface the message; only missing REST resources get 404.
    pub fn status_code(&self) -> StatusCode {
        match self.root() {
            AppError::DatabaseError(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ExternalApiError(_) => StatusCode::BAD_GATEWAY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::WithContext { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to end users.
    pub fn public_message(&self) -> String {
        match self.root() {
            AppError::DatabaseError(_) => "Database error".to_string(),
            AppError::InternalError(_) => "Internal server error".to_string(),
            AppError::ExternalApiError(msg) => format!("External service error: {}", msg),
            AppError::Unauthorized(_) => "Unauthorized".to_string(),
            AppError::NotFound(msg) | AppError::Conflict(msg) | AppError::Validation(msg) => {
                msg.clone()
            }
            AppError::WithContext { .. } => "Internal server error".to_string(),
        }
    }

    /// True when the underlying database error is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self.root() {
            AppError::DatabaseError(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

/// Uniform `{success, message, error?}` body returned by every action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            data: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            data: None,
        }
    }

    /// Attaches a serializable payload. Serialization failures drop the payload.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => self.data = Some(value),
            Err(e) => tracing::warn!("Failed to serialize action payload: {}", e),
        }
        self
    }
}

impl From<&AppError> for ActionResult {
    fn from(err: &AppError) -> Self {
        let public = err.public_message();
        ActionResult::failed(public.clone(), public)
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status and an `ActionResult` body.
    /// Server-side failures are logged with their full context chain.
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self.root() {
            AppError::DatabaseError(_) | AppError::InternalError(_) => {
                tracing::error!("{}", self);
            }
            AppError::ExternalApiError(_) => tracing::error!("{}", self),
            AppError::Unauthorized(_) => tracing::warn!("{}", self),
            _ => tracing::debug!("{}", self),
        }

        (status, Json(ActionResult::from(&self))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}
