//! HTTP error mapping for API handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::error::{
    ActionPlanError, ChecklistError, DatabaseError, DuelError, Error, EvidenceError, SyncError,
};

/// Error returned by handlers; rendered as `{"error": ...}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    App(Error),
}

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self::App(err.into())
    }
}

impl ApiError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} {id} not found"))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::App(err) => app_status(err),
        }
    }
}

fn app_status(err: &Error) -> StatusCode {
    match err {
        Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
        Error::Checklist(ChecklistError::AlreadyCompleted { .. }) => StatusCode::CONFLICT,
        Error::Checklist(ChecklistError::SignaturePending { .. }) => StatusCode::CONFLICT,
        Error::Checklist(ChecklistError::AlreadySigned { .. }) => StatusCode::CONFLICT,
        Error::Checklist(ChecklistError::NotCompleted { .. }) => StatusCode::CONFLICT,
        Error::Checklist(ChecklistError::NoPendingDraft { .. }) => StatusCode::CONFLICT,
        Error::Checklist(ChecklistError::UnknownQuestion(_)) => StatusCode::BAD_REQUEST,
        Error::Checklist(_) | Error::Rule(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Duel(DuelError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Error::Duel(DuelError::NotParticipant { .. }) => StatusCode::FORBIDDEN,
        Error::Duel(_) => StatusCode::BAD_REQUEST,
        Error::ActionPlan(ActionPlanError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Error::ActionPlan(ActionPlanError::MissingTitle) => StatusCode::BAD_REQUEST,
        Error::Sync(SyncError::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Sync(SyncError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Sync(SyncError::Conflict { .. }) => StatusCode::CONFLICT,
        Error::Sync(_) => StatusCode::BAD_GATEWAY,
        Error::Evidence(EvidenceError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::BadRequest(msg) | Self::NotFound(msg) | Self::Conflict(msg) => {
                json!({ "error": msg })
            }
            Self::App(err @ Error::Checklist(ChecklistError::Incomplete { missing })) => {
                json!({ "error": err.to_string(), "missing": missing })
            }
            Self::App(err) => json!({ "error": err.to_string() }),
        };
        if status.is_server_error() {
            error!(status = %status, error = ?self, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}
