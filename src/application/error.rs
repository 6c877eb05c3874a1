use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    application::repos::RepoError, domain::error::DomainError, infra::error::InfraError,
    resilience::ResilienceError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

pub mod codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const VALIDATION: &str = "validation";
    pub const CONFLICT: &str = "conflict";
    pub const UNAVAILABLE: &str = "store_unavailable";
    pub const MISCONFIGURED: &str = "misconfigured";
    pub const UNEXPECTED: &str = "unexpected";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{context}: store unavailable after {attempts} attempts: {message}")]
    Unavailable {
        context: String,
        attempts: u32,
        message: String,
    },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Whether repeating the request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Unavailable { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Domain(DomainError::NotFound { .. }) | AppError::NotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Infra(InfraError::Database { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Infra(InfraError::Configuration { .. })
            | AppError::Infra(InfraError::Telemetry(_))
            | AppError::Infra(InfraError::Io(_))
            | AppError::Infra(InfraError::Bind { .. })
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Domain(DomainError::NotFound { .. }) | AppError::NotFound => codes::NOT_FOUND,
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                codes::VALIDATION
            }
            AppError::Conflict(_) => codes::CONFLICT,
            AppError::Unavailable { .. } | AppError::Infra(InfraError::Database { .. }) => {
                codes::UNAVAILABLE
            }
            AppError::Infra(InfraError::Configuration { .. }) => codes::MISCONFIGURED,
            AppError::Infra(_) | AppError::Unexpected(_) => codes::UNEXPECTED,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Domain(DomainError::NotFound { .. }) | AppError::NotFound => {
                "Resource not found"
            }
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                "Request could not be processed"
            }
            AppError::Conflict(_) => "Request conflicts with stored data",
            AppError::Unavailable { .. } | AppError::Infra(InfraError::Database { .. }) => {
                "Service temporarily unavailable, please retry"
            }
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Infra(InfraError::Bind { .. }) => "Listener could not be started",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }

    /// Detail safe to show to the caller alongside the generic message.
    fn hint(&self) -> Option<String> {
        match self {
            AppError::Domain(DomainError::Validation { .. })
            | AppError::Validation(_)
            | AppError::Conflict(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => AppError::NotFound,
            RepoError::Duplicate { constraint } => {
                AppError::Conflict(format!("duplicate record violates `{constraint}`"))
            }
            RepoError::Integrity { message } => AppError::Conflict(message),
            RepoError::InvalidInput { message } | RepoError::Validation { message } => {
                AppError::Validation(message)
            }
            RepoError::Unavailable(message) => AppError::Unavailable {
                context: "store".to_string(),
                attempts: 1,
                message,
            },
            RepoError::Timeout => AppError::Unavailable {
                context: "store".to_string(),
                attempts: 1,
                message: "database timeout".to_string(),
            },
            RepoError::Persistence(message) => AppError::Unexpected(message),
        }
    }
}

impl From<ResilienceError<RepoError>> for AppError {
    fn from(err: ResilienceError<RepoError>) -> Self {
        match err {
            ResilienceError::Permanent { source, .. } => source.into(),
            ResilienceError::Exhausted {
                context,
                attempts,
                source,
            } => AppError::Unavailable {
                context,
                attempts,
                message: source.to_string(),
            },
            ResilienceError::Cancelled { context } => AppError::Unavailable {
                context,
                attempts: 0,
                message: "request cancelled".to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code().to_string(),
                message: self.presentation_message().to_string(),
                hint: self.hint(),
                retryable: self.is_retryable(),
            },
        };
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}
