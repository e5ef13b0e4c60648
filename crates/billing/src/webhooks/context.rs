use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio_util::task::TaskTracker;

use super::ProcessorSettings;
use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::client::PaymentProvider;
use crate::email::{BillingEmail, BillingMailer};
use crate::error::BillingResult;
use crate::identity::IdentityProvider;
use crate::store::BillingStore;

/// Everything a handler needs for one event
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub store: Arc<dyn BillingStore>,
    pub stripe: Arc<dyn PaymentProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub mailer: Arc<dyn BillingMailer>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub tracker: TaskTracker,
    pub settings: Arc<ProcessorSettings>,
    pub event_id: String,
    pub event_type: String,
    /// Processing time, read once per event
    pub now: OffsetDateTime,
}

impl HandlerContext {
    /// Run non-critical work after the response. Failures are logged only.
    pub fn spawn_detached<F>(&self, task: &'static str, work: F)
    where
        F: Future<Output = BillingResult<()>> + Send + 'static,
    {
        let event_id = self.event_id.clone();
        let event_type = self.event_type.clone();
        self.tracker.spawn(async move {
            if let Err(e) = work.await {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    task = task,
                    error = %e,
                    "Background webhook task failed"
                );
            }
        });
    }

    pub fn track(&self, event: AnalyticsEvent) {
        let sink = self.analytics.clone();
        self.spawn_detached("analytics", async move { sink.capture(&event).await });
    }

    pub fn send_email(&self, email: BillingEmail) {
        let mailer = self.mailer.clone();
        self.spawn_detached("email", async move { mailer.send(&email).await });
    }

    pub fn app_url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.settings.app_base_url.trim_end_matches('/'),
            path
        )
    }
}
