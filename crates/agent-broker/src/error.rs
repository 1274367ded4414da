use agent_broker_api::{ErrorResponse, ERROR_ASYNC_REQUIRED, ERROR_CONCURRENCY};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::manifest::RenderError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("unknown plan id {0}")]
    BadPlan(String),

    #[error("instance {0} already exists")]
    Conflict(String),

    #[error("instance {0} not found")]
    NotFound(String),

    #[error("instance {0} is gone")]
    Gone(String),

    #[error("this service requires client support for asynchronous operations (accepts_incomplete=true)")]
    AsyncRequired,

    #[error("another operation for instance {0} is still in progress")]
    ConcurrentOperation(String),

    #[error("version {requested} is below the minimum supported version {floor}")]
    VersionRejected { requested: String, floor: String },

    #[error("missing or invalid broker credentials")]
    Unauthorized,

    #[error("deployment backend request failed: {0:#}")]
    Backend(anyhow::Error),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::BadPlan(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::AsyncRequired | Self::ConcurrentOperation(_) | Self::VersionRejected { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Backend(_) | Self::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::BadPlan(_) => "UnknownPlan",
            Self::Conflict(_) => "Conflict",
            Self::NotFound(_) => "NotFound",
            Self::Gone(_) => "Gone",
            Self::AsyncRequired => ERROR_ASYNC_REQUIRED,
            Self::ConcurrentOperation(_) => ERROR_CONCURRENCY,
            Self::VersionRejected { .. } => "VersionRejected",
            Self::Unauthorized => "Unauthorized",
            Self::Backend(_) => "BackendFailure",
            Self::Render(_) => "RenderFailure",
        }
    }

    fn description(&self) -> String {
        match self {
            Self::VersionRejected { floor, .. } => format!(
                "{self}; versions older than {floor} are blocked by security policy, \
                 request version {floor} or newer (or omit the version to get the current default)"
            ),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = ErrorResponse::new(self.code(), Some(self.description()));
        (status, Json(body)).into_response()
    }
}
