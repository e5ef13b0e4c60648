//! Stripe webhook endpoint
//!
//! The body is taken as raw bytes: the signature covers the exact payload, so
//! nothing may parse or re-serialise it before verification.

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: String,
    pub event_type: String,
    pub processing_time_ms: i64,
}

/// POST /api/webhooks/stripe
///
/// 400 when the delivery cannot be trusted or its event object cannot be
/// decoded, 500 when processing failed and the provider should retry, 200
/// otherwise (duplicates included).
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let started = Instant::now();

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivery without Stripe-Signature header");
            ApiError::BadRequest("Missing Stripe-Signature header".to_string())
        })?;

    let event = state.verifier.verify_event(&body, signature)?;

    match state.processor.process_event(&event).await {
        Ok(outcome) => Ok(Json(WebhookResponse {
            message: outcome.message,
            event_type: outcome.event_type,
            processing_time_ms: outcome.processing_time_ms,
        })),
        Err(e) => {
            state.processor.record_failure(&event, started, &e).await;
            // Signed but undecodable objects never succeed on retry
            if e.is_rejection() {
                return Err(ApiError::from(e));
            }
            Err(ApiError::Internal(format!("Webhook processing failed: {}", e)))
        }
    }
}
