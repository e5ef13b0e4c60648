//! Application state

use std::sync::Arc;

use photovault_billing::{WebhookProcessor, WebhookVerifier};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Applies verified Stripe events to billing state
    pub processor: WebhookProcessor,
    /// Checks `Stripe-Signature` against the endpoint secret
    pub verifier: Arc<WebhookVerifier>,
}

impl AppState {
    pub fn new(processor: WebhookProcessor, webhook_secret: &str) -> Self {
        Self {
            processor,
            verifier: Arc::new(WebhookVerifier::new(webhook_secret)),
        }
    }
}
