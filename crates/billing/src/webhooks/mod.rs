//! Stripe webhook processing
//!
//! [`WebhookProcessor::process_event`] is the dispatcher: it checks the
//! idempotency gate, routes the event to exactly one handler, and marks the
//! event processed only after the handler succeeds. Handler errors propagate
//! unchanged so the caller can answer with a retryable status.
//!
//! Handlers mutate billing state inline. Notifications and analytics are
//! spawned on a [`TaskTracker`] and never affect the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio_util::task::TaskTracker;

use crate::analytics::AnalyticsSink;
use crate::client::PaymentProvider;
use crate::email::BillingMailer;
use crate::error::{BillingError, BillingResult};
use crate::event::{EventKind, WebhookEvent};
use crate::identity::IdentityProvider;
use crate::models::WebhookLog;
use crate::store::BillingStore;

mod checkout;
mod churn;
mod context;
mod discount;
mod family;
mod gallery;
mod invoice;
mod payout;
mod reactivation;
mod subscription;
mod tokens;

pub(crate) use context::HandlerContext;

/// Source of "now" for handlers
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Tunables for the webhook handlers
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Base URL for links in emails
    pub app_base_url: String,
    /// Promotional coupon that enrols photographers in the beta program
    pub beta_coupon_id: String,
    pub beta_locked_price_cents: i64,
    /// Upper bound on churn aggregate queries
    pub churn_stats_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            app_base_url: "http://localhost:3000".to_string(),
            beta_coupon_id: "PHOTOVAULT_BETA".to_string(),
            beta_locked_price_cents: 2200,
            churn_stats_timeout: Duration::from_secs(2),
        }
    }
}

/// External collaborators used by the handlers
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn BillingStore>,
    pub stripe: Arc<dyn PaymentProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub mailer: Arc<dyn BillingMailer>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

/// Result of a successfully handled delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub message: String,
    pub event_type: String,
    pub processing_time_ms: i64,
    /// The event was seen before and no handler ran
    pub already_processed: bool,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    deps: Collaborators,
    settings: Arc<ProcessorSettings>,
    clock: Arc<dyn Clock>,
    tracker: TaskTracker,
}

impl WebhookProcessor {
    pub fn new(deps: Collaborators, settings: ProcessorSettings) -> Self {
        Self {
            deps,
            settings: Arc::new(settings),
            clock: Arc::new(SystemClock),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.deps.store
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Wait for detached notification and analytics tasks to finish.
    ///
    /// The tracker stays usable afterwards; events processed later can
    /// still spawn work.
    pub async fn drain_background(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Process a verified event
    pub async fn process_event(&self, event: &WebhookEvent) -> BillingResult<ProcessOutcome> {
        let started = Instant::now();

        if self.deps.store.is_event_processed(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.type_,
                "Duplicate webhook event, skipping"
            );
            return Ok(ProcessOutcome {
                message: "Already processed".to_string(),
                event_type: event.type_.clone(),
                processing_time_ms: elapsed_ms(started),
                already_processed: true,
            });
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            "Processing Stripe webhook event"
        );

        let ctx = HandlerContext {
            store: self.deps.store.clone(),
            stripe: self.deps.stripe.clone(),
            identity: self.deps.identity.clone(),
            mailer: self.deps.mailer.clone(),
            analytics: self.deps.analytics.clone(),
            tracker: self.tracker.clone(),
            settings: self.settings.clone(),
            event_id: event.id.clone(),
            event_type: event.type_.clone(),
            now: self.clock.now(),
        };

        let message = match self.route(&ctx, event).await {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    error = %e,
                    "Webhook handler failed"
                );
                return Err(e);
            }
        };

        self.deps
            .store
            .mark_event_processed(&event.id, &event.type_)
            .await?;

        let processing_time_ms = elapsed_ms(started);
        let log = WebhookLog::success(&event.id, &event.type_, processing_time_ms, &message);
        if let Err(e) = self.deps.store.insert_webhook_log(&log).await {
            tracing::warn!(event_id = %event.id, error = %e, "Failed to write webhook success log");
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            processing_time_ms = processing_time_ms,
            result = %message,
            "Webhook event processed"
        );

        Ok(ProcessOutcome {
            message,
            event_type: event.type_.clone(),
            processing_time_ms,
            already_processed: false,
        })
    }

    /// Best-effort failure log for a delivery that could not be processed.
    ///
    /// Never fails: the caller is already answering with an error.
    pub async fn record_failure(&self, event: &WebhookEvent, started: Instant, error: &BillingError) {
        let log = WebhookLog::failure(
            &event.id,
            &event.type_,
            elapsed_ms(started),
            error.to_string(),
            Some(format!("{:?}", error)),
        );
        if let Err(e) = self.deps.store.insert_webhook_log(&log).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                original_error = %error,
                "Failed to write webhook failure log"
            );
        }
    }

    async fn route(&self, ctx: &HandlerContext, event: &WebhookEvent) -> BillingResult<String> {
        match event.kind() {
            EventKind::CheckoutSessionCompleted => {
                checkout::handle_checkout_completed(ctx, event.object()?).await
            }
            EventKind::SubscriptionCreated => {
                subscription::handle_subscription_created(ctx, event.object()?).await
            }
            EventKind::SubscriptionUpdated => {
                subscription::handle_subscription_updated(ctx, event.object()?).await
            }
            EventKind::SubscriptionDeleted => {
                subscription::handle_subscription_deleted(ctx, event.object()?).await
            }
            EventKind::InvoicePaymentSucceeded => {
                invoice::handle_payment_succeeded(ctx, event.object()?).await
            }
            EventKind::InvoicePaymentFailed => {
                invoice::handle_payment_failed(ctx, event.object()?).await
            }
            EventKind::PayoutCreated => {
                payout::handle_payout_created(ctx, event.account.as_deref(), event.object()?).await
            }
            EventKind::DiscountCreated => {
                discount::handle_discount_created(ctx, event.object()?).await
            }
            EventKind::Unhandled => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(format!("Event type {} not handled", event.type_))
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
