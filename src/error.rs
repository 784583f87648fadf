use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use opentelemetry::trace::TraceContextExt;
use serde_json::json;
use thiserror::Error;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::llm::ProviderError;
use crate::pipeline::sanitize::FormatError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Report template {0} is inactive")]
    InactiveTemplate(i32),

    #[error("Provider not configured: {0}")]
    ProviderUnconfigured(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Provider timeout: {0}")]
    ProviderTimeout(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Error formatting HTML: {0}")]
    Formatting(#[from] FormatError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unconfigured(kind) => {
                AppError::ProviderUnconfigured(format!("{kind} API key is not set"))
            }
            ProviderError::Timeout(msg) => AppError::ProviderTimeout(msg),
            ProviderError::Cancelled => AppError::Cancelled,
            other => AppError::Llm(other.to_string()),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::InactiveTemplate(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ProviderUnconfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Llm(_) => StatusCode::BAD_GATEWAY,
            AppError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::Formatting(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable label, used for span and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::InactiveTemplate(_) => "inactive_template",
            AppError::ProviderUnconfigured(_) => "provider_unconfigured",
            AppError::Llm(_) => "provider_error",
            AppError::ProviderTimeout(_) => "provider_timeout",
            AppError::Cancelled => "cancelled",
            AppError::Formatting(_) => "formatting",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }
}

fn get_trace_id() -> Option<String> {
    let span = Span::current();
    let context = span.context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();

    if span_context.is_valid() {
        Some(span_context.trace_id().to_string())
    } else {
        None
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_message = match &self {
            AppError::Validation(msg)
            | AppError::NotFound(msg)
            | AppError::PayloadTooLarge(msg) => msg.clone(),
            AppError::InactiveTemplate(_) | AppError::Cancelled => self.to_string(),
            AppError::ProviderUnconfigured(msg) => {
                tracing::warn!(error = %msg, "Provider not configured");
                self.to_string()
            }
            AppError::Llm(msg) | AppError::ProviderTimeout(msg) => {
                tracing::error!(error = %msg, "LLM error");
                format!("Could not generate report: {msg}")
            }
            AppError::Formatting(e) => {
                tracing::error!(error = %e, "Formatting error");
                "Internal server error".to_string()
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                "Internal server error".to_string()
            }
        };

        let body = if let Some(trace_id) = get_trace_id() {
            json!({
                "error": error_message,
                "status": status.as_u16(),
                "trace_id": trace_id,
            })
        } else {
            json!({
                "error": error_message,
                "status": status.as_u16(),
            })
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
