// ============================================================================
// File: src/error.rs
// Error taxonomy and its HTTP mapping
// ============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    /// A chat, search, payment or email provider failed or timed out
    #[error("{service} is unavailable: {source}")]
    UpstreamUnavailable {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Structured model output did not match the declared schema
    #[error("malformed structured response: {0}")]
    MalformedStructuredResponse(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    /// An integration needed by a mandatory stage has no credentials
    #[error("{0} is not configured")]
    ConfigurationMissing(&'static str),
}

impl AdvisorError {
    pub fn upstream(service: &'static str, source: anyhow::Error) -> Self {
        Self::UpstreamUnavailable { service, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable { .. }
            | Self::MalformedStructuredResponse(_)
            | Self::ConfigurationMissing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdvisorError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Validation(msg) | Self::Unauthorized(msg) => msg.clone(),
            Self::UpstreamUnavailable { service, source } => {
                tracing::error!(service, error = ?source, "upstream call failed");
                format!("Failed to reach {service}")
            }
            other => {
                tracing::error!(error = %other, "request failed");
                "Internal server error".to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
