//! API error type with stable kind tags.
//!
//! Every failure surfaced over HTTP carries one of the documented kinds;
//! the body is `{"error": {"kind": ..., "message": ...}}`. Internal
//! errors are logged with a trace id that is echoed to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use conductor_core::artifacts::ArtifactError;
use conductor_core::artifacts::diff::DiffError;
use conductor_core::broker::BrokerError;
use conductor_core::orchestrator::OrchestratorError;

/// Stable error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Conflict,
    LlmExhausted,
    Transient,
    Internal,
}

impl ErrorKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth | Self::Forbidden => "auth",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::LlmExhausted => "llm_exhausted",
            Self::Transient => "transient",
            Self::Internal => "internal",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::LlmExhausted | Self::Transient => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        let trace_id = Uuid::new_v4();
        tracing::error!(trace_id = %trace_id, error = format!("{err:#}"), "internal error");
        Self::new(
            ErrorKind::Internal,
            format!("internal error (trace {trace_id})"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = serde_json::json!({
            "error": {"kind": self.kind.tag(), "message": self.message}
        });
        let mut response = (status, Json(body)).into_response();
        if self.kind == ErrorKind::Transient {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("5"));
        }
        response
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation { .. } => Self::validation(err.to_string()),
            OrchestratorError::JobNotFound(_) | OrchestratorError::TaskNotFound(_) => {
                Self::not_found(err.to_string())
            }
            OrchestratorError::InvalidState(_) => Self::conflict(err.to_string()),
            OrchestratorError::Broker(broker) => broker.into(),
            OrchestratorError::Storage(inner) => Self::internal(inner),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::MessageNotFound(_) => Self::not_found(err.to_string()),
            BrokerError::Storage(_) => Self::new(ErrorKind::Transient, err.to_string()),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(_) => Self::not_found(err.to_string()),
            ArtifactError::InvalidRole(_) | ArtifactError::InvalidPromotion { .. } => {
                Self::validation(err.to_string())
            }
            ArtifactError::FrozenKey { .. } | ArtifactError::Conflict { .. } => {
                Self::conflict(err.to_string())
            }
            ArtifactError::Storage(inner) => Self::internal(inner),
        }
    }
}

impl From<DiffError> for ApiError {
    fn from(err: DiffError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}
