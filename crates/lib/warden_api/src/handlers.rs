//! HTTP handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use warden_core::{CallerContext, CoreError};

use crate::AppState;
use crate::commands::Command;
use crate::envelope::Envelope;

/// `POST /rpc`: decode one command and dispatch it.
pub async fn rpc(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerContext>,
    payload: Result<Json<Command>, JsonRejection>,
) -> Response {
    let command = match payload {
        Ok(Json(command)) => command,
        Err(rejection) => {
            let err = CoreError::validation([format!("body: {}", rejection.body_text())]);
            return Envelope::<Value>::failure(&err).into_response();
        }
    };
    state.dispatcher.dispatch(&caller, command).await.into_response()
}

/// `GET /health`.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": warden_core::version() }))
}
