// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider error text
#![allow(clippy::too_many_arguments)] // Some ledger writes take many columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PhotoVault Billing Module
//!
//! Processes Stripe webhook deliveries and applies them to billing state.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with timestamp tolerance
//! - **Idempotency**: Each event id is applied at most once
//! - **Gallery Payments**: Upfront annual purchases with buyer account provisioning
//! - **Commissions**: Platform/photographer split for upfront, monthly and reactivation payments
//! - **Subscriptions**: Lifecycle mirroring and churn tracking
//! - **Dunning**: 180-day grace period anchored at the first failed payment
//! - **Payouts, Tokens, Beta Pricing**: Connected-account payouts, token packs, beta coupon
//! - **Notifications**: Transactional email and product analytics, off the critical path

pub mod analytics;
pub mod client;
pub mod commission;
pub mod email;
pub mod error;
pub mod event;
pub mod grace;
pub mod identity;
pub mod models;
pub mod signature;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Analytics
pub use analytics::{AnalyticsConfig, AnalyticsEvent, AnalyticsSink, PostHogAnalytics};

// Client
pub use client::{PaymentProvider, StripeClient, StripeConfig};

// Commission
pub use commission::CommissionSplit;

// Email
pub use email::{BillingEmail, BillingMailer, EmailConfig, ResendMailer};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{EventKind, WebhookEvent};

// Grace period
pub use grace::{FailureOutcome, GRACE_PERIOD_DAYS};

// Identity
pub use identity::{IdentityConfig, IdentityProvider, SupabaseIdentityProvider};

// Signature
pub use signature::WebhookVerifier;

// Store
pub use store::{BillingStore, PgBillingStore};

// Webhooks
pub use webhooks::{
    Clock, Collaborators, ProcessOutcome, ProcessorSettings, SystemClock, WebhookProcessor,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Build a webhook processor backed by Postgres and the live providers,
/// reading provider credentials from the environment
pub fn processor_from_env(pool: PgPool, settings: ProcessorSettings) -> BillingResult<WebhookProcessor> {
    let store = Arc::new(PgBillingStore::new(pool));
    let stripe = Arc::new(StripeClient::from_env()?);
    let identity = Arc::new(SupabaseIdentityProvider::new(IdentityConfig::from_env()?));

    let email_config = EmailConfig::from_env();
    if email_config.resend_api_key.is_none() {
        tracing::warn!("RESEND_API_KEY not set, billing emails are disabled");
    }
    let analytics_config = AnalyticsConfig::from_env();
    if analytics_config.api_key.is_none() {
        tracing::warn!("POSTHOG_API_KEY not set, billing analytics are disabled");
    }

    Ok(WebhookProcessor::new(
        Collaborators {
            store,
            stripe,
            identity,
            mailer: Arc::new(ResendMailer::new(email_config)),
            analytics: Arc::new(PostHogAnalytics::new(analytics_config)),
        },
        settings,
    ))
}
