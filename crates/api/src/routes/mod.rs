//! HTTP routes

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub mod health;
pub mod webhooks;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .with_state(state)
}
