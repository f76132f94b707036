//! Caller-context extraction from `Authorization: Bearer`.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;
use warden_core::CallerContext;

use crate::AppState;

/// Attach a [`CallerContext`] to every request.
///
/// Requests without a verifiable bearer token proceed anonymously; the
/// operations that need an identity reject them.
pub async fn caller_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    let caller = match bearer {
        Some(token) => match state.dispatcher.services().tokens.authenticate(&token).await {
            Ok(claims) => match claims.user_id() {
                Some(user_id) => CallerContext::authenticated(user_id, token),
                None => CallerContext::anonymous(),
            },
            Err(e) => {
                debug!(error = %e, "bearer token rejected");
                CallerContext::anonymous()
            }
        },
        None => CallerContext::anonymous(),
    };

    request.extensions_mut().insert(caller);
    next.run(request).await
}
