//! Product analytics events
//!
//! One synchronous capture request per event, no batching: the process may
//! be stopped right after a webhook response and nothing should be left in
//! a buffer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const CLIENT_PAYMENT_COMPLETED: &str = "client_payment_completed";
pub const PHOTOGRAPHER_PAYMENT_RECEIVED: &str = "photographer_payment_received";
pub const GALLERY_PAID: &str = "gallery_paid";
pub const PAYMENT_FAILED: &str = "payment_failed";
pub const PHOTOGRAPHER_CHURNED: &str = "photographer_churned";
pub const CLIENT_CHURNED: &str = "client_churned";

/// A tracked event
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub distinct_id: Uuid,
    pub event: &'static str,
    pub properties: Value,
}

impl AnalyticsEvent {
    pub fn new(distinct_id: Uuid, event: &'static str, properties: Value) -> Self {
        Self {
            distinct_id,
            event,
            properties,
        }
    }
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn capture(&self, event: &AnalyticsEvent) -> BillingResult<()>;
}

/// Analytics configuration
#[derive(Clone)]
pub struct AnalyticsConfig {
    /// Tracking is disabled when unset
    pub api_key: Option<String>,
    pub host: String,
}

impl AnalyticsConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("POSTHOG_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            host: std::env::var("POSTHOG_HOST")
                .unwrap_or_else(|_| "https://us.i.posthog.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

impl std::fmt::Debug for AnalyticsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("host", &self.host)
            .finish()
    }
}

#[derive(Serialize)]
struct CaptureRequest<'a> {
    api_key: &'a str,
    event: &'a str,
    distinct_id: String,
    properties: &'a Value,
    timestamp: String,
}

/// PostHog capture API client
#[derive(Clone)]
pub struct PostHogAnalytics {
    config: AnalyticsConfig,
    http: Client,
}

impl PostHogAnalytics {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(AnalyticsConfig::from_env())
    }
}

#[async_trait]
impl AnalyticsSink for PostHogAnalytics {
    async fn capture(&self, event: &AnalyticsEvent) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(event = event.event, "Analytics disabled, skipping capture");
            return Ok(());
        };

        let body = CaptureRequest {
            api_key,
            event: event.event,
            distinct_id: event.distinct_id.to_string(),
            properties: &event.properties,
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .map_err(|e| BillingError::Analytics(e.to_string()))?,
        };

        let response = self
            .http
            .post(format!("{}/capture/", self.config.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Analytics(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::Analytics(format!(
                "capture returned {}",
                response.status()
            )));
        }

        tracing::debug!(event = event.event, distinct_id = %event.distinct_id, "Analytics event captured");
        Ok(())
    }
}
