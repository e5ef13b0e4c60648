//! Relational records read and written by the webhook pipeline

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Subscription lifecycle status mirrored from Stripe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a Stripe status onto the four states tracked locally.
    ///
    /// Stripe's `unpaid`/`incomplete` collapse into `past_due` and
    /// `incomplete_expired` into `canceled`.
    pub fn from_stripe(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::PastDue,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Upfront,
    Monthly,
    Reactivation,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Upfront => "upfront",
            PaymentType::Monthly => "monthly",
            PaymentType::Reactivation => "reactivation",
        }
    }
}

/// Local subscription row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub gallery_id: Option<Uuid>,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub status: String,
    pub plan_type: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub payment_failure_count: i32,
    /// Anchor of the current dunning cycle: written on the first failure
    /// and left alone by later failures, cleared by a successful payment
    pub last_payment_failure_at: Option<OffsetDateTime>,
    pub access_suspended: bool,
    pub access_suspended_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Fields written when a subscription is created or mirrored from Stripe
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub gallery_id: Option<Uuid>,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub plan_type: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

/// Grace-period bookkeeping written after a failed invoice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentFailureUpdate {
    pub payment_failure_count: i32,
    pub last_payment_failure_at: Option<OffsetDateTime>,
    pub access_suspended: bool,
    pub access_suspended_at: Option<OffsetDateTime>,
}

/// Restores a gallery subscription to active, unsuspended service
#[derive(Debug, Clone)]
pub struct SubscriptionRestore {
    pub gallery_id: Uuid,
    /// Reassign ownership (family takeover); `None` keeps the current owner
    pub new_owner: Option<(Uuid, Option<String>)>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCommission {
    pub photographer_id: Uuid,
    pub gallery_id: Option<Uuid>,
    pub client_email: Option<String>,
    pub amount_cents: i64,
    pub total_paid_cents: i64,
    pub shoot_fee_cents: i64,
    pub storage_fee_cents: i64,
    pub photovault_commission_cents: i64,
    pub payment_type: PaymentType,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_transfer_id: Option<String>,
    pub paid_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPaymentHistory {
    pub stripe_invoice_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub paid_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPayout {
    pub photographer_id: Uuid,
    pub stripe_payout_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub arrival_date: Option<OffsetDateTime>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: String,
    pub stripe_customer_id: Option<String>,
}

impl UserProfile {
    pub fn is_photographer(&self) -> bool {
        self.role == "photographer"
    }

    /// Name for greetings, falling back to the email's local part
    pub fn display_name(&self) -> String {
        self.full_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                self.email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "there".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewUserProfile {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClientRecord {
    pub id: Uuid,
    pub photographer_id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GalleryRecord {
    pub id: Uuid,
    pub photographer_id: Uuid,
    pub client_id: Option<Uuid>,
    pub gallery_name: String,
    pub payment_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookLogStatus {
    Success,
    Failed,
}

impl WebhookLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookLogStatus::Success => "success",
            WebhookLogStatus::Failed => "failed",
        }
    }
}

/// Append-only audit record, one per delivery attempt
#[derive(Debug, Clone, Serialize)]
pub struct WebhookLog {
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookLogStatus,
    pub processing_time_ms: i64,
    pub result_message: Option<String>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub processed_at: OffsetDateTime,
}

impl WebhookLog {
    pub fn success(
        event_id: &str,
        event_type: &str,
        processing_time_ms: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            status: WebhookLogStatus::Success,
            processing_time_ms,
            result_message: Some(message.into()),
            error_message: None,
            stack_trace: None,
            processed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn failure(
        event_id: &str,
        event_type: &str,
        processing_time_ms: i64,
        error: impl Into<String>,
        stack_trace: Option<String>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            status: WebhookLogStatus::Failed,
            processing_time_ms,
            result_message: None,
            error_message: Some(error.into()),
            stack_trace,
            processed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Aggregates attached to a photographer churn event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhotographerChurnStats {
    pub lifetime_revenue_cents: i64,
    pub client_count: i64,
    pub gallery_count: i64,
}

/// Aggregates attached to a client churn event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientChurnStats {
    pub photographer_id: Option<Uuid>,
    pub gallery_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_status_collapse() {
        assert_eq!(SubscriptionStatus::from_stripe("active"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from_stripe("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::from_stripe("incomplete"), SubscriptionStatus::PastDue);
        assert_eq!(
            SubscriptionStatus::from_stripe("incomplete_expired"),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut profile = UserProfile {
            id: Uuid::new_v4(),
            email: Some("jane.doe@example.com".into()),
            full_name: None,
            role: "client".into(),
            stripe_customer_id: None,
        };
        assert_eq!(profile.display_name(), "jane.doe");

        profile.full_name = Some("Jane Doe".into());
        assert_eq!(profile.display_name(), "Jane Doe");

        profile.full_name = None;
        profile.email = None;
        assert_eq!(profile.display_name(), "there");
    }
}
