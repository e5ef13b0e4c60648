//! Stripe webhook event envelope and payload objects
//!
//! Only the fields the pipeline reads are modelled. Payloads are kept as raw
//! JSON in the envelope and deserialised into a typed object by the handler
//! that owns the event type, so an unfamiliar API version only breaks the
//! handlers whose fields actually moved.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Verified Stripe event envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEvent {
    /// Event id (`evt_...`), the idempotency key
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    /// Connected account the event originated from (Connect events only)
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.type_)
    }

    /// Deserialise the event's data object into the handler's payload type
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::InvalidPayload(format!("{} object: {}", self.type_, e))
        })
    }
}

/// Event types routed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    PayoutCreated,
    DiscountCreated,
    Unhandled,
}

impl EventKind {
    pub fn from_type(type_: &str) -> Self {
        match type_ {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "payout.created" => Self::PayoutCreated,
            "customer.discount.created" => Self::DiscountCreated,
            _ => Self::Unhandled,
        }
    }
}

/// Stripe metadata map
pub type Metadata = HashMap<String, String>;

/// Metadata accessors tolerant of both key spellings.
///
/// Checkout sessions created by the public checkout flow use camelCase keys,
/// the authenticated flow uses snake_case. Lookups are written in camelCase
/// and fall back to the snake_case spelling.
pub trait MetadataExt {
    fn text(&self, key: &str) -> Option<&str>;

    fn flag(&self, key: &str) -> bool {
        matches!(self.text(key), Some("true") | Some("1"))
    }

    fn uuid(&self, field: &'static str) -> BillingResult<Option<Uuid>> {
        match self.text(field) {
            None => Ok(None),
            Some(raw) => Uuid::parse_str(raw)
                .map(Some)
                .map_err(|_| BillingError::InvalidMetadata {
                    field,
                    value: raw.to_string(),
                }),
        }
    }

    fn cents(&self, field: &'static str) -> BillingResult<Option<i64>> {
        match self.text(field) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| BillingError::InvalidMetadata {
                    field,
                    value: raw.to_string(),
                }),
        }
    }
}

impl MetadataExt for Metadata {
    fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .or_else(|| self.get(&snake_case(key)))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// A Stripe reference that may arrive as a bare id or an expanded object
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) => id,
            ExpandableId::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// `checkout.session.completed` payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<ExpandableId>,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CheckoutSession {
    /// Payment reference used for bookkeeping: the payment intent when the
    /// session produced one, otherwise the session itself
    pub fn payment_reference(&self) -> &str {
        self.payment_intent
            .as_ref()
            .map(|p| p.id())
            .unwrap_or(&self.id)
    }

    /// Billing email captured by Stripe during checkout
    pub fn captured_email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
            .filter(|e| !e.is_empty())
    }

    pub fn customer_name(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.name.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

/// `customer.subscription.*` payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: ExpandableId,
    pub status: String,
    #[serde(default)]
    pub items: List<SubscriptionItem>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl StripeSubscription {
    /// Billing period of the subscription.
    ///
    /// Read from the first line item: recent API versions only carry the
    /// period there. Subscriptions are single-item, so the first item is
    /// authoritative.
    pub fn billing_period(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let item = self.items.data.first();
        let start = item
            .and_then(|i| i.current_period_start)
            .or(self.current_period_start)?;
        let end = item
            .and_then(|i| i.current_period_end)
            .or(self.current_period_end)?;
        Some((unix_to_datetime(start)?, unix_to_datetime(end)?))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Period {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

/// `invoice.*` payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeInvoice {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub charge: Option<ExpandableId>,
    #[serde(default)]
    pub payment_intent: Option<ExpandableId>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub lines: List<InvoiceLine>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl StripeInvoice {
    /// Subscription the invoice bills, wherever the API version put it
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id()).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_ref())
                .map(|s| s.id())
        })
    }

    /// Service period covered by the invoice, preferring the first line
    pub fn service_period(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let (start, end) = match self.lines.data.first().and_then(|l| l.period.as_ref()) {
            Some(period) => (period.start, period.end),
            None => (self.period_start?, self.period_end?),
        };
        Some((unix_to_datetime(start)?, unix_to_datetime(end)?))
    }

    pub fn is_first_payment(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}

/// `payout.created` payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripePayout {
    pub id: String,
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub arrival_date: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Coupon {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscountSource {
    #[serde(default)]
    pub coupon: Option<ExpandableId>,
}

/// `customer.discount.created` payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeDiscount {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub coupon: Option<Coupon>,
    #[serde(default)]
    pub source: Option<DiscountSource>,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
}

impl StripeDiscount {
    pub fn coupon_id(&self) -> Option<&str> {
        self.coupon.as_ref().map(|c| c.id.as_str()).or_else(|| {
            self.source
                .as_ref()
                .and_then(|s| s.coupon.as_ref())
                .map(|c| c.id())
        })
    }
}

pub(crate) fn unix_to_datetime(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}
