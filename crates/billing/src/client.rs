//! Stripe API client wrapper
//!
//! The webhook pipeline only reads from Stripe: it recovers references that
//! are not present on the event object itself (transfer ids, subscription
//! metadata, customer emails).

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use stripe::{
    Charge, ChargeId, Client, Customer, CustomerId, Expandable, PaymentIntent, PaymentIntentId,
    Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};
use crate::event::Metadata;

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

/// Read-only lookups against the payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Transfer created for the payment intent's charge (Connect destination charges)
    async fn payment_intent_transfer_id(&self, payment_intent_id: &str)
        -> BillingResult<Option<String>>;

    async fn charge_transfer_id(&self, charge_id: &str) -> BillingResult<Option<String>>;

    /// Metadata attached to the subscription at checkout time
    async fn subscription_metadata(&self, subscription_id: &str) -> BillingResult<Metadata>;

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>>;
}

/// Live Stripe client.
///
/// The underlying HTTP client is built on first use and then shared; it is
/// stateless apart from the secret key it was created with.
#[derive(Clone)]
pub struct StripeClient {
    config: StripeConfig,
    inner: std::sync::Arc<OnceCell<Client>>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            config,
            inner: std::sync::Arc::new(OnceCell::new()),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn inner(&self) -> &Client {
        self.inner.get_or_init(|| {
            tracing::debug!("Initialising Stripe API client");
            Client::new(self.config.secret_key.clone())
        })
    }
}

fn parse_id<T: std::str::FromStr>(kind: &str, raw: &str) -> BillingResult<T> {
    raw.parse::<T>()
        .map_err(|_| BillingError::StripeApi(format!("invalid {} id: {}", kind, raw)))
}

fn transfer_of(charge: &Charge) -> Option<String> {
    charge.transfer.as_ref().map(|t| t.id().to_string())
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn payment_intent_transfer_id(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<String>> {
        let id: PaymentIntentId = parse_id("payment intent", payment_intent_id)?;
        let intent = PaymentIntent::retrieve(self.inner(), &id, &["latest_charge"]).await?;

        match intent.latest_charge {
            Some(Expandable::Object(charge)) => Ok(transfer_of(&charge)),
            Some(Expandable::Id(charge_id)) => self.charge_transfer_id(charge_id.as_str()).await,
            None => Ok(None),
        }
    }

    async fn charge_transfer_id(&self, charge_id: &str) -> BillingResult<Option<String>> {
        let id: ChargeId = parse_id("charge", charge_id)?;
        let charge = Charge::retrieve(self.inner(), &id, &[]).await?;
        Ok(transfer_of(&charge))
    }

    async fn subscription_metadata(&self, subscription_id: &str) -> BillingResult<Metadata> {
        let id: SubscriptionId = parse_id("subscription", subscription_id)?;
        let subscription = Subscription::retrieve(self.inner(), &id, &[]).await?;
        Ok(subscription.metadata.into_iter().collect())
    }

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let id: CustomerId = parse_id("customer", customer_id)?;
        let customer = Customer::retrieve(self.inner(), &id, &[]).await?;
        Ok(customer.email)
    }
}
