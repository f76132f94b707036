//! # warden_api
//!
//! Command boundary and HTTP API library for Warden.

pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod handlers;
pub mod middleware;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use warden_core::Services;

pub use commands::Command;
pub use dispatcher::Dispatcher;
pub use envelope::Envelope;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            dispatcher: Dispatcher::new(services),
        }
    }
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/rpc", post(handlers::rpc))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::caller_context,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
