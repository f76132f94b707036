//! Uniform result envelope.
//!
//! Every command outcome, success or failure, is reported as
//! `{success, title, errors, message, data?}`. This is the only place core
//! errors are translated for callers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use warden_core::{CoreError, CoreResult, ErrorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    pub title: String,
    pub errors: Vec<String>,
    pub message: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip)]
    kind: Option<ErrorKind>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            title: "Success".into(),
            errors: Vec::new(),
            message: message.into(),
            data: Some(data),
            kind: None,
        }
    }

    /// Failure envelope. Internal errors are logged here and replaced by a
    /// generic message.
    pub fn failure(err: &CoreError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::Internal {
            tracing::error!(error = %err, "command failed");
        }
        Self {
            success: false,
            title: err.title().into(),
            errors: err.field_errors().to_vec(),
            message: err.public_message(),
            data: None,
            kind: Some(kind),
        }
    }

    pub fn from_result(result: CoreResult<T>, message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok(data, message),
            Err(err) => Self::failure(&err),
        }
    }

    /// Failure classification, `None` for successes.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.kind.map_or(StatusCode::OK, status_for)
    }
}

/// HTTP status for a failure kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}
