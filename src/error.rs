use crate::db::models::RequestState;
use thiserror::Error;
use tracing::error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Params Validation Error")]
    ParamsValidation(String),

    #[error("Body Validation Error")]
    BodyValidation(String),

    #[error("Request Validation Error")]
    RequestValidation(String),

    #[error("Missing Authorization header")]
    MissingAuthorization,

    #[error("Project not found, disabled or you are not authorizad to access it")]
    ProjectNotAuthorized,

    #[error("Project not completely configured")]
    ProjectIncomplete,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("Expected the request to be in state \"{expected}\" but was in state \"{actual}\"")]
    UnexpectedState {
        expected: RequestState,
        actual: RequestState,
    },

    /// A strategy broke its contract with the orchestrator
    #[error("{0}")]
    Contract(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unprocessable<S: Into<String>>(msg: S) -> Self {
        Self::Unprocessable(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Validation failures carry a detail message next to the error label
    fn detail(&self) -> Option<&str> {
        match self {
            Self::ParamsValidation(msg) | Self::BodyValidation(msg) | Self::RequestValidation(msg) => {
                Some(msg)
            }
            _ => None,
        }
    }

    /// Errors whose text must never reach the caller
    fn is_opaque(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Database(_) | Self::Http(_) | Self::Internal(_)
        )
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convert AppError to HTTP status codes for web responses
impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ParamsValidation(_) => StatusCode::BAD_REQUEST,
            Self::BodyValidation(_) => StatusCode::BAD_REQUEST,
            Self::RequestValidation(_) => StatusCode::BAD_REQUEST,
            Self::MissingAuthorization => StatusCode::FORBIDDEN,
            Self::ProjectNotAuthorized => StatusCode::NOT_FOUND,
            Self::ProjectIncomplete => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UnexpectedState { .. } => StatusCode::BAD_REQUEST,
            Self::Contract(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = if self.is_opaque() {
            error!("Unhandled error: {}", self);
            serde_json::json!({ "error": "Something went wrong..." })
        } else if let Some(message) = self.detail() {
            serde_json::json!({ "error": self.to_string(), "message": message })
        } else {
            serde_json::json!({ "error": self.to_string() })
        };
        (status, axum::Json(body)).into_response()
    }
}
