//! Test doubles for the webhook pipeline
//!
//! Shared by this crate's unit tests and, behind the `testing` feature, by
//! the API crate's router tests.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::analytics::{AnalyticsEvent, AnalyticsSink};
use crate::client::PaymentProvider;
use crate::email::{BillingEmail, BillingMailer};
use crate::error::{BillingError, BillingResult};
use crate::event::{Metadata, WebhookEvent};
use crate::identity::{Identity, IdentityProvider, NewIdentity};
use crate::webhooks::{Clock, Collaborators, ProcessorSettings, WebhookProcessor};

mod store;

pub use store::{
    InMemoryBillingStore, StoredErrorLog, StoredGallery, StoredProfile, StoredTokenTransaction,
};

// ============================================================================
// Payment provider
// ============================================================================

#[derive(Default)]
pub struct MockPaymentProvider {
    pub transfers_by_payment_intent: Mutex<HashMap<String, String>>,
    pub transfers_by_charge: Mutex<HashMap<String, String>>,
    pub subscription_metadata: Mutex<HashMap<String, Metadata>>,
    pub customer_emails: Mutex<HashMap<String, String>>,
    pub fail: AtomicBool,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription_metadata(self, subscription_id: &str, pairs: &[(&str, &str)]) -> Self {
        let metadata = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.subscription_metadata
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), metadata);
        self
    }

    pub fn with_customer_email(self, customer_id: &str, email: &str) -> Self {
        self.customer_emails
            .lock()
            .unwrap()
            .insert(customer_id.to_string(), email.to_string());
        self
    }

    pub fn with_payment_intent_transfer(self, payment_intent_id: &str, transfer_id: &str) -> Self {
        self.transfers_by_payment_intent
            .lock()
            .unwrap()
            .insert(payment_intent_id.to_string(), transfer_id.to_string());
        self
    }

    fn check(&self) -> BillingResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi("simulated Stripe outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn payment_intent_transfer_id(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<String>> {
        self.check()?;
        Ok(self
            .transfers_by_payment_intent
            .lock()
            .unwrap()
            .get(payment_intent_id)
            .cloned())
    }

    async fn charge_transfer_id(&self, charge_id: &str) -> BillingResult<Option<String>> {
        self.check()?;
        Ok(self.transfers_by_charge.lock().unwrap().get(charge_id).cloned())
    }

    async fn subscription_metadata(&self, subscription_id: &str) -> BillingResult<Metadata> {
        self.check()?;
        Ok(self
            .subscription_metadata
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        self.check()?;
        Ok(self.customer_emails.lock().unwrap().get(customer_id).cloned())
    }
}

// ============================================================================
// Identity provider
// ============================================================================

#[derive(Default)]
pub struct InMemoryIdentityProvider {
    pub users: Mutex<Vec<Identity>>,
    pub created: Mutex<Vec<NewIdentity>>,
    pub create_calls: AtomicUsize,
    /// Next `create` loses a race: this identity appears and the call
    /// reports that the email already exists
    race_winner: Mutex<Option<Identity>>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, id: Uuid, email: &str) -> Self {
        self.users.lock().unwrap().push(Identity {
            id,
            email: Some(email.to_string()),
        });
        self
    }

    /// Simulate a concurrent delivery registering `email` between our lookup
    /// and our create call
    pub fn lose_next_create_race(&self, id: Uuid, email: &str) {
        *self.race_winner.lock().unwrap() = Some(Identity {
            id,
            email: Some(email.to_string()),
        });
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Identity>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| {
                u.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn create(&self, identity: &NewIdentity) -> BillingResult<Identity> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(winner) = self.race_winner.lock().unwrap().take() {
            self.users.lock().unwrap().push(winner);
            return Err(BillingError::IdentityAlreadyExists(identity.email.clone()));
        }

        let mut users = self.users.lock().unwrap();
        if users.iter().any(|u| {
            u.email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(&identity.email))
        }) {
            return Err(BillingError::IdentityAlreadyExists(identity.email.clone()));
        }

        let created = Identity {
            id: Uuid::new_v4(),
            email: Some(identity.email.clone()),
        };
        users.push(created.clone());
        self.created.lock().unwrap().push(identity.clone());
        Ok(created)
    }
}

// ============================================================================
// Mailer and analytics
// ============================================================================

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<BillingEmail>>,
    pub fail: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<BillingEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl BillingMailer for RecordingMailer {
    async fn send(&self, email: &BillingEmail) -> BillingResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::Email("simulated mail outage".to_string()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAnalytics {
    pub events: Mutex<Vec<AnalyticsEvent>>,
    pub fail: AtomicBool,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.event).collect()
    }
}

#[async_trait]
impl AnalyticsSink for RecordingAnalytics {
    async fn capture(&self, event: &AnalyticsEvent) -> BillingResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::Analytics("simulated analytics outage".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Clock
// ============================================================================

pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A processor wired to in-memory collaborators, with handles kept for
/// seeding and assertions
pub struct TestHarness {
    pub store: Arc<InMemoryBillingStore>,
    pub stripe: Arc<MockPaymentProvider>,
    pub identity: Arc<InMemoryIdentityProvider>,
    pub mailer: Arc<RecordingMailer>,
    pub analytics: Arc<RecordingAnalytics>,
    pub clock: Arc<FixedClock>,
    pub processor: WebhookProcessor,
}

impl TestHarness {
    pub fn new(now: OffsetDateTime) -> Self {
        Self::builder(now).build()
    }

    pub fn builder(now: OffsetDateTime) -> TestHarnessBuilder {
        TestHarnessBuilder {
            now,
            stripe: MockPaymentProvider::new(),
            identity: InMemoryIdentityProvider::new(),
            settings: ProcessorSettings::default(),
        }
    }

    /// Process an event and wait for its detached tasks
    pub async fn deliver(&self, event: &WebhookEvent) -> BillingResult<crate::webhooks::ProcessOutcome> {
        let outcome = self.processor.process_event(event).await;
        self.processor.drain_background().await;
        outcome
    }
}

pub struct TestHarnessBuilder {
    now: OffsetDateTime,
    stripe: MockPaymentProvider,
    identity: InMemoryIdentityProvider,
    settings: ProcessorSettings,
}

impl TestHarnessBuilder {
    pub fn stripe(mut self, stripe: MockPaymentProvider) -> Self {
        self.stripe = stripe;
        self
    }

    pub fn identity(mut self, identity: InMemoryIdentityProvider) -> Self {
        self.identity = identity;
        self
    }

    pub fn settings(mut self, settings: ProcessorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> TestHarness {
        let store = Arc::new(InMemoryBillingStore::new());
        let stripe = Arc::new(self.stripe);
        let identity = Arc::new(self.identity);
        let mailer = Arc::new(RecordingMailer::new());
        let analytics = Arc::new(RecordingAnalytics::new());
        let clock = Arc::new(FixedClock::new(self.now));

        let processor = WebhookProcessor::new(
            Collaborators {
                store: store.clone(),
                stripe: stripe.clone(),
                identity: identity.clone(),
                mailer: mailer.clone(),
                analytics: analytics.clone(),
            },
            self.settings,
        )
        .with_clock(clock.clone());

        TestHarness {
            store,
            stripe,
            identity,
            mailer,
            analytics,
            clock,
            processor,
        }
    }
}

// ============================================================================
// Event fixtures
// ============================================================================

/// Build an event envelope around a data object
pub fn event(id: &str, type_: &str, object: serde_json::Value) -> WebhookEvent {
    WebhookEvent {
        id: id.to_string(),
        type_: type_.to_string(),
        created: 1_700_000_000,
        account: None,
        livemode: false,
        data: crate::event::EventData { object },
    }
}

/// Wire-format JSON for an event, as Stripe would deliver it
pub fn event_json(id: &str, type_: &str, object: serde_json::Value) -> String {
    serde_json::json!({
        "id": id,
        "object": "event",
        "type": type_,
        "created": 1_700_000_000,
        "livemode": false,
        "data": { "object": object },
    })
    .to_string()
}
