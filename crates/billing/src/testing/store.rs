//! In-memory [`BillingStore`] mirroring the Postgres schema's constraints

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    ClientChurnStats, ClientRecord, GalleryRecord, NewCommission, NewPaymentHistory, NewPayout,
    NewUserProfile, PaymentFailureUpdate, PhotographerChurnStats, SubscriptionRecord,
    SubscriptionRestore, SubscriptionStatus, SubscriptionUpsert, UserProfile, WebhookLog,
};
use crate::store::BillingStore;

/// Profile row including the columns the pipeline writes but never reads back
#[derive(Debug, Clone)]
pub struct StoredProfile {
    pub profile: UserProfile,
    pub stripe_connect_account_id: Option<String>,
    pub token_balance: i64,
    pub is_beta_tester: bool,
    pub beta_locked_price_cents: Option<i64>,
    pub beta_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct StoredGallery {
    pub gallery: GalleryRecord,
    pub stripe_payment_intent_id: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct StoredTokenTransaction {
    pub user_id: Uuid,
    pub amount: i64,
    pub stripe_session_id: String,
}

#[derive(Debug, Clone)]
pub struct StoredErrorLog {
    pub source: String,
    pub message: String,
    pub context: serde_json::Value,
}

#[derive(Default)]
struct State {
    processed_events: HashMap<String, String>,
    webhook_logs: Vec<WebhookLog>,
    error_logs: Vec<StoredErrorLog>,
    profiles: HashMap<Uuid, StoredProfile>,
    clients: HashMap<Uuid, ClientRecord>,
    galleries: HashMap<Uuid, StoredGallery>,
    subscriptions: Vec<SubscriptionRecord>,
    commissions: Vec<NewCommission>,
    payment_history: Vec<NewPaymentHistory>,
    payouts: Vec<NewPayout>,
    token_transactions: Vec<StoredTokenTransaction>,
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
    /// Operations that fail with a database error, by method name
    failing: Mutex<HashSet<&'static str>>,
    churn_stats_delay: Mutex<Option<Duration>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named store operation fail until [`Self::heal`] is called
    pub fn fail_on(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    /// Delay churn aggregate queries, simulating a slow database
    pub fn delay_churn_stats(&self, delay: Duration) {
        *self.churn_stats_delay.lock().unwrap() = Some(delay);
    }

    fn check(&self, operation: &'static str) -> BillingResult<()> {
        if self.failing.lock().unwrap().contains(operation) {
            return Err(BillingError::Database(format!(
                "simulated failure in {}",
                operation
            )));
        }
        Ok(())
    }

    // Seeding

    pub fn add_profile(&self, id: Uuid, email: &str, role: &str) -> UserProfile {
        let profile = UserProfile {
            id,
            email: Some(email.to_string()),
            full_name: None,
            role: role.to_string(),
            stripe_customer_id: None,
        };
        self.state.lock().unwrap().profiles.insert(
            id,
            StoredProfile {
                profile: profile.clone(),
                stripe_connect_account_id: None,
                token_balance: 0,
                is_beta_tester: false,
                beta_locked_price_cents: None,
                beta_started_at: None,
            },
        );
        profile
    }

    pub fn set_customer_id(&self, user_id: Uuid, customer_id: &str) {
        if let Some(row) = self.state.lock().unwrap().profiles.get_mut(&user_id) {
            row.profile.stripe_customer_id = Some(customer_id.to_string());
        }
    }

    pub fn set_connect_account(&self, user_id: Uuid, account_id: &str) {
        if let Some(row) = self.state.lock().unwrap().profiles.get_mut(&user_id) {
            row.stripe_connect_account_id = Some(account_id.to_string());
        }
    }

    pub fn set_full_name(&self, user_id: Uuid, name: &str) {
        if let Some(row) = self.state.lock().unwrap().profiles.get_mut(&user_id) {
            row.profile.full_name = Some(name.to_string());
        }
    }

    pub fn add_client(&self, client: ClientRecord) {
        self.state.lock().unwrap().clients.insert(client.id, client);
    }

    pub fn add_gallery(&self, id: Uuid, photographer_id: Uuid, client_id: Option<Uuid>, name: &str) {
        self.state.lock().unwrap().galleries.insert(
            id,
            StoredGallery {
                gallery: GalleryRecord {
                    id,
                    photographer_id,
                    client_id,
                    gallery_name: name.to_string(),
                    payment_status: "unpaid".to_string(),
                },
                stripe_payment_intent_id: None,
                paid_at: None,
            },
        );
    }

    pub fn add_subscription(&self, subscription: SubscriptionRecord) {
        self.state.lock().unwrap().subscriptions.push(subscription);
    }

    // Inspection

    pub fn profile(&self, id: Uuid) -> Option<StoredProfile> {
        self.state.lock().unwrap().profiles.get(&id).cloned()
    }

    pub fn profiles(&self) -> Vec<StoredProfile> {
        self.state.lock().unwrap().profiles.values().cloned().collect()
    }

    pub fn client(&self, id: Uuid) -> Option<ClientRecord> {
        self.state.lock().unwrap().clients.get(&id).cloned()
    }

    pub fn gallery(&self, id: Uuid) -> Option<StoredGallery> {
        self.state.lock().unwrap().galleries.get(&id).cloned()
    }

    pub fn subscription(&self, stripe_subscription_id: &str) -> Option<SubscriptionRecord> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .cloned()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn commissions(&self) -> Vec<NewCommission> {
        self.state.lock().unwrap().commissions.clone()
    }

    pub fn payment_history(&self) -> Vec<NewPaymentHistory> {
        self.state.lock().unwrap().payment_history.clone()
    }

    pub fn payouts(&self) -> Vec<NewPayout> {
        self.state.lock().unwrap().payouts.clone()
    }

    pub fn token_transactions(&self) -> Vec<StoredTokenTransaction> {
        self.state.lock().unwrap().token_transactions.clone()
    }

    pub fn webhook_logs(&self) -> Vec<WebhookLog> {
        self.state.lock().unwrap().webhook_logs.clone()
    }

    pub fn error_logs(&self) -> Vec<StoredErrorLog> {
        self.state.lock().unwrap().error_logs.clone()
    }

    pub fn processed_event_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .processed_events
            .keys()
            .cloned()
            .collect()
    }

    async fn churn_delay(&self) {
        let delay = *self.churn_stats_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn restore_into(subscription: &mut SubscriptionRecord, restore: &SubscriptionRestore) {
    if let Some((owner, customer)) = &restore.new_owner {
        subscription.user_id = *owner;
        if customer.is_some() {
            subscription.stripe_customer_id = customer.clone();
        }
    }
    subscription.status = SubscriptionStatus::Active.as_str().to_string();
    subscription.current_period_start = Some(restore.period_start);
    subscription.current_period_end = Some(restore.period_end);
    subscription.cancel_at_period_end = false;
    subscription.canceled_at = None;
    subscription.payment_failure_count = 0;
    subscription.last_payment_failure_at = None;
    subscription.access_suspended = false;
    subscription.access_suspended_at = None;
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        self.check("is_event_processed")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .processed_events
            .contains_key(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str, event_type: &str) -> BillingResult<()> {
        self.check("mark_event_processed")?;
        self.state
            .lock()
            .unwrap()
            .processed_events
            .entry(event_id.to_string())
            .or_insert_with(|| event_type.to_string());
        Ok(())
    }

    async fn insert_webhook_log(&self, log: &WebhookLog) -> BillingResult<()> {
        self.check("insert_webhook_log")?;
        self.state.lock().unwrap().webhook_logs.push(log.clone());
        Ok(())
    }

    async fn insert_error_log(
        &self,
        source: &str,
        message: &str,
        context: serde_json::Value,
    ) -> BillingResult<()> {
        self.check("insert_error_log")?;
        self.state.lock().unwrap().error_logs.push(StoredErrorLog {
            source: source.to_string(),
            message: message.to_string(),
            context,
        });
        Ok(())
    }

    async fn find_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        self.check("find_profile")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .profiles
            .get(&user_id)
            .map(|p| p.profile.clone()))
    }

    async fn find_profile_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserProfile>> {
        self.check("find_profile_by_customer")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .profiles
            .values()
            .find(|p| p.profile.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|p| p.profile.clone()))
    }

    async fn find_profile_by_connect_account(
        &self,
        account_id: &str,
    ) -> BillingResult<Option<UserProfile>> {
        self.check("find_profile_by_connect_account")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .profiles
            .values()
            .find(|p| p.stripe_connect_account_id.as_deref() == Some(account_id))
            .map(|p| p.profile.clone()))
    }

    async fn insert_profile(&self, profile: &NewUserProfile) -> BillingResult<()> {
        self.check("insert_profile")?;
        let mut state = self.state.lock().unwrap();
        if state.profiles.contains_key(&profile.id) {
            return Err(BillingError::Database(
                "duplicate key value violates unique constraint \"user_profiles_pkey\"".to_string(),
            ));
        }
        state.profiles.insert(
            profile.id,
            StoredProfile {
                profile: UserProfile {
                    id: profile.id,
                    email: Some(profile.email.clone()),
                    full_name: profile.full_name.clone(),
                    role: profile.role.clone(),
                    stripe_customer_id: None,
                },
                stripe_connect_account_id: None,
                token_balance: 0,
                is_beta_tester: false,
                beta_locked_price_cents: None,
                beta_started_at: None,
            },
        );
        Ok(())
    }

    async fn attach_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        self.check("attach_customer_id")?;
        if let Some(row) = self.state.lock().unwrap().profiles.get_mut(&user_id) {
            if row.profile.stripe_customer_id.is_none() {
                row.profile.stripe_customer_id = Some(customer_id.to_string());
            }
        }
        Ok(())
    }

    async fn enable_beta_pricing(
        &self,
        user_id: Uuid,
        locked_price_cents: i64,
        started_at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.check("enable_beta_pricing")?;
        if let Some(row) = self.state.lock().unwrap().profiles.get_mut(&user_id) {
            row.is_beta_tester = true;
            row.beta_locked_price_cents = Some(locked_price_cents);
            row.beta_started_at = Some(started_at);
        }
        Ok(())
    }

    async fn find_client(&self, client_id: Uuid) -> BillingResult<Option<ClientRecord>> {
        self.check("find_client")?;
        Ok(self.state.lock().unwrap().clients.get(&client_id).cloned())
    }

    async fn link_client_user(&self, client_id: Uuid, user_id: Uuid) -> BillingResult<()> {
        self.check("link_client_user")?;
        if let Some(client) = self.state.lock().unwrap().clients.get_mut(&client_id) {
            client.user_id = Some(user_id);
        }
        Ok(())
    }

    async fn find_gallery(&self, gallery_id: Uuid) -> BillingResult<Option<GalleryRecord>> {
        self.check("find_gallery")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .galleries
            .get(&gallery_id)
            .map(|g| g.gallery.clone()))
    }

    async fn mark_gallery_paid(
        &self,
        gallery_id: Uuid,
        payment_reference: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        self.check("mark_gallery_paid")?;
        let mut state = self.state.lock().unwrap();
        let Some(gallery) = state.galleries.get_mut(&gallery_id) else {
            return Ok(false);
        };
        gallery.gallery.payment_status = "paid".to_string();
        gallery.stripe_payment_intent_id = Some(payment_reference.to_string());
        gallery.paid_at = Some(paid_at);
        Ok(true)
    }

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check("find_subscription")?;
        Ok(self.subscription(stripe_subscription_id))
    }

    async fn upsert_subscription(
        &self,
        subscription: &SubscriptionUpsert,
    ) -> BillingResult<SubscriptionRecord> {
        self.check("upsert_subscription")?;
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == subscription.stripe_subscription_id)
        {
            existing.user_id = subscription.user_id;
            if subscription.gallery_id.is_some() {
                existing.gallery_id = subscription.gallery_id;
            }
            if subscription.stripe_customer_id.is_some() {
                existing.stripe_customer_id = subscription.stripe_customer_id.clone();
            }
            existing.status = subscription.status.as_str().to_string();
            existing.plan_type = subscription.plan_type.clone();
            existing.current_period_start = subscription.current_period_start;
            existing.current_period_end = subscription.current_period_end;
            existing.cancel_at_period_end = subscription.cancel_at_period_end;
            existing.canceled_at = subscription.canceled_at;
            return Ok(existing.clone());
        }

        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: subscription.user_id,
            gallery_id: subscription.gallery_id,
            stripe_subscription_id: subscription.stripe_subscription_id.clone(),
            stripe_customer_id: subscription.stripe_customer_id.clone(),
            status: subscription.status.as_str().to_string(),
            plan_type: subscription.plan_type.clone(),
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at,
            payment_failure_count: 0,
            last_payment_failure_at: None,
            access_suspended: false,
            access_suspended_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn cancel_subscription(
        &self,
        stripe_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check("cancel_subscription")?;
        let mut state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .map(|s| {
                s.status = SubscriptionStatus::Canceled.as_str().to_string();
                s.canceled_at = Some(canceled_at);
                s.clone()
            }))
    }

    async fn record_payment_success(
        &self,
        stripe_subscription_id: &str,
        period: Option<(OffsetDateTime, OffsetDateTime)>,
    ) -> BillingResult<()> {
        self.check("record_payment_success")?;
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
        {
            s.status = SubscriptionStatus::Active.as_str().to_string();
            if let Some((start, end)) = period {
                s.current_period_start = Some(start);
                s.current_period_end = Some(end);
            }
            s.payment_failure_count = 0;
            s.last_payment_failure_at = None;
            s.access_suspended = false;
            s.access_suspended_at = None;
        }
        Ok(())
    }

    async fn record_payment_failure(
        &self,
        stripe_subscription_id: &str,
        update: &PaymentFailureUpdate,
    ) -> BillingResult<()> {
        self.check("record_payment_failure")?;
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
        {
            s.status = SubscriptionStatus::PastDue.as_str().to_string();
            s.payment_failure_count = update.payment_failure_count;
            s.last_payment_failure_at = update.last_payment_failure_at;
            s.access_suspended = update.access_suspended;
            s.access_suspended_at = update.access_suspended_at;
        }
        Ok(())
    }

    async fn restore_gallery_subscription(
        &self,
        restore: &SubscriptionRestore,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check("restore_gallery_subscription")?;
        let mut state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter_mut()
            .filter(|s| s.gallery_id == Some(restore.gallery_id))
            .max_by_key(|s| s.created_at)
            .map(|s| {
                restore_into(s, restore);
                s.clone()
            }))
    }

    async fn insert_commission(&self, commission: &NewCommission) -> BillingResult<()> {
        self.check("insert_commission")?;
        let mut state = self.state.lock().unwrap();
        let duplicate = commission.stripe_payment_intent_id.is_some()
            && state.commissions.iter().any(|c| {
                c.stripe_payment_intent_id == commission.stripe_payment_intent_id
                    && c.payment_type == commission.payment_type
            });
        if duplicate {
            return Err(BillingError::Database(
                "duplicate key value violates unique constraint \"idx_commissions_payment\""
                    .to_string(),
            ));
        }
        state.commissions.push(commission.clone());
        Ok(())
    }

    async fn has_commission_for_photographer(&self, photographer_id: Uuid) -> BillingResult<bool> {
        self.check("has_commission_for_photographer")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .commissions
            .iter()
            .any(|c| c.photographer_id == photographer_id))
    }

    async fn has_commission_for_client(&self, client_email: &str) -> BillingResult<bool> {
        self.check("has_commission_for_client")?;
        Ok(self.state.lock().unwrap().commissions.iter().any(|c| {
            c.client_email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(client_email))
        }))
    }

    async fn insert_payment_history(&self, entry: &NewPaymentHistory) -> BillingResult<()> {
        self.check("insert_payment_history")?;
        self.state.lock().unwrap().payment_history.push(entry.clone());
        Ok(())
    }

    async fn insert_payout(&self, payout: &NewPayout) -> BillingResult<()> {
        self.check("insert_payout")?;
        let mut state = self.state.lock().unwrap();
        match state
            .payouts
            .iter_mut()
            .find(|p| p.stripe_payout_id == payout.stripe_payout_id)
        {
            Some(existing) => existing.status = payout.status.clone(),
            None => state.payouts.push(payout.clone()),
        }
        Ok(())
    }

    async fn claim_token_purchase(
        &self,
        user_id: Uuid,
        amount: i64,
        session_id: &str,
    ) -> BillingResult<bool> {
        self.check("claim_token_purchase")?;
        let mut state = self.state.lock().unwrap();
        if state
            .token_transactions
            .iter()
            .any(|t| t.stripe_session_id == session_id)
        {
            return Ok(false);
        }
        state.token_transactions.push(StoredTokenTransaction {
            user_id,
            amount,
            stripe_session_id: session_id.to_string(),
        });
        Ok(true)
    }

    async fn release_token_purchase(&self, session_id: &str) -> BillingResult<()> {
        self.check("release_token_purchase")?;
        self.state
            .lock()
            .unwrap()
            .token_transactions
            .retain(|t| t.stripe_session_id != session_id);
        Ok(())
    }

    async fn increment_token_balance(&self, user_id: Uuid, amount: i64) -> BillingResult<i64> {
        self.check("increment_token_balance")?;
        let mut state = self.state.lock().unwrap();
        let row = state.profiles.get_mut(&user_id).ok_or_else(|| {
            BillingError::Database(format!("no profile for token purchase user {}", user_id))
        })?;
        row.token_balance += amount;
        Ok(row.token_balance)
    }

    async fn photographer_churn_stats(
        &self,
        user_id: Uuid,
    ) -> BillingResult<PhotographerChurnStats> {
        self.churn_delay().await;
        self.check("photographer_churn_stats")?;
        let state = self.state.lock().unwrap();
        Ok(PhotographerChurnStats {
            lifetime_revenue_cents: state
                .commissions
                .iter()
                .filter(|c| c.photographer_id == user_id)
                .map(|c| c.amount_cents)
                .sum(),
            client_count: state
                .clients
                .values()
                .filter(|c| c.photographer_id == user_id)
                .count() as i64,
            gallery_count: state
                .galleries
                .values()
                .filter(|g| g.gallery.photographer_id == user_id)
                .count() as i64,
        })
    }

    async fn client_churn_stats(&self, user_id: Uuid) -> BillingResult<ClientChurnStats> {
        self.churn_delay().await;
        self.check("client_churn_stats")?;
        let state = self.state.lock().unwrap();
        let client_ids: Vec<Uuid> = state
            .clients
            .values()
            .filter(|c| c.user_id == Some(user_id))
            .map(|c| c.id)
            .collect();
        Ok(ClientChurnStats {
            photographer_id: state
                .clients
                .values()
                .find(|c| c.user_id == Some(user_id))
                .map(|c| c.photographer_id),
            gallery_count: state
                .galleries
                .values()
                .filter(|g| g.gallery.client_id.is_some_and(|id| client_ids.contains(&id)))
                .count() as i64,
        })
    }

    async fn ping(&self) -> BillingResult<()> {
        self.check("ping")
    }
}
