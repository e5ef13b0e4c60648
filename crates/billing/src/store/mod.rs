//! Billing persistence
//!
//! Every relational read and write made by the webhook pipeline goes through
//! [`BillingStore`]. Writes are independent statements; nothing here spans a
//! transaction across tables.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    ClientChurnStats, ClientRecord, GalleryRecord, NewCommission, NewPaymentHistory, NewPayout,
    NewUserProfile, PaymentFailureUpdate, PhotographerChurnStats, SubscriptionRecord,
    SubscriptionRestore, SubscriptionUpsert, UserProfile, WebhookLog,
};

pub mod postgres;

pub use postgres::PgBillingStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Idempotency and audit

    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool>;

    async fn mark_event_processed(&self, event_id: &str, event_type: &str) -> BillingResult<()>;

    async fn insert_webhook_log(&self, log: &WebhookLog) -> BillingResult<()>;

    async fn insert_error_log(
        &self,
        source: &str,
        message: &str,
        context: serde_json::Value,
    ) -> BillingResult<()>;

    // Profiles

    async fn find_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>>;

    async fn find_profile_by_customer(&self, customer_id: &str)
        -> BillingResult<Option<UserProfile>>;

    async fn find_profile_by_connect_account(
        &self,
        account_id: &str,
    ) -> BillingResult<Option<UserProfile>>;

    async fn insert_profile(&self, profile: &NewUserProfile) -> BillingResult<()>;

    async fn attach_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()>;

    async fn enable_beta_pricing(
        &self,
        user_id: Uuid,
        locked_price_cents: i64,
        started_at: OffsetDateTime,
    ) -> BillingResult<()>;

    // Clients and galleries

    async fn find_client(&self, client_id: Uuid) -> BillingResult<Option<ClientRecord>>;

    async fn link_client_user(&self, client_id: Uuid, user_id: Uuid) -> BillingResult<()>;

    async fn find_gallery(&self, gallery_id: Uuid) -> BillingResult<Option<GalleryRecord>>;

    /// Returns `false` when no gallery row matched
    async fn mark_gallery_paid(
        &self,
        gallery_id: Uuid,
        payment_reference: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    // Subscriptions

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert or update keyed on `stripe_subscription_id`. Failure tracking
    /// columns are left untouched on update.
    async fn upsert_subscription(
        &self,
        subscription: &SubscriptionUpsert,
    ) -> BillingResult<SubscriptionRecord>;

    async fn cancel_subscription(
        &self,
        stripe_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Record a paid period: status active, failure tracking reset, access restored
    async fn record_payment_success(
        &self,
        stripe_subscription_id: &str,
        period: Option<(OffsetDateTime, OffsetDateTime)>,
    ) -> BillingResult<()>;

    /// Record a failed payment: status past_due plus the grace-period bookkeeping
    async fn record_payment_failure(
        &self,
        stripe_subscription_id: &str,
        update: &PaymentFailureUpdate,
    ) -> BillingResult<()>;

    async fn restore_gallery_subscription(
        &self,
        restore: &SubscriptionRestore,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    // Money ledgers

    async fn insert_commission(&self, commission: &NewCommission) -> BillingResult<()>;

    async fn has_commission_for_photographer(&self, photographer_id: Uuid) -> BillingResult<bool>;

    async fn has_commission_for_client(&self, client_email: &str) -> BillingResult<bool>;

    async fn insert_payment_history(&self, entry: &NewPaymentHistory) -> BillingResult<()>;

    async fn insert_payout(&self, payout: &NewPayout) -> BillingResult<()>;

    // Tokens

    /// Record a token purchase in the ledger, keyed by checkout session.
    /// Returns `false` when the session was already recorded.
    async fn claim_token_purchase(
        &self,
        user_id: Uuid,
        amount: i64,
        session_id: &str,
    ) -> BillingResult<bool>;

    /// Drop a claim whose balance update failed so a redelivery can retry it
    async fn release_token_purchase(&self, session_id: &str) -> BillingResult<()>;

    /// Add tokens to a balance, returning the new balance
    async fn increment_token_balance(&self, user_id: Uuid, amount: i64) -> BillingResult<i64>;

    // Churn aggregates

    async fn photographer_churn_stats(
        &self,
        user_id: Uuid,
    ) -> BillingResult<PhotographerChurnStats>;

    async fn client_churn_stats(&self, user_id: Uuid) -> BillingResult<ClientChurnStats>;

    async fn ping(&self) -> BillingResult<()>;
}
