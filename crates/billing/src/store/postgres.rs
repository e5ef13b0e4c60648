//! Postgres implementation of [`BillingStore`]

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::BillingStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ClientChurnStats, ClientRecord, GalleryRecord, NewCommission, NewPaymentHistory, NewPayout,
    NewUserProfile, PaymentFailureUpdate, PhotographerChurnStats, SubscriptionRecord,
    SubscriptionRestore, SubscriptionStatus, SubscriptionUpsert, UserProfile, WebhookLog,
};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, gallery_id, stripe_subscription_id, stripe_customer_id, status, plan_type,
    current_period_start, current_period_end, cancel_at_period_end, canceled_at,
    payment_failure_count, last_payment_failure_at, access_suspended, access_suspended_at,
    created_at
"#;

const PROFILE_COLUMNS: &str = "id, email, full_name, role, stripe_customer_id";

/// Postgres SQLSTATE for a call to a function that does not exist
const UNDEFINED_FUNCTION: &str = "42883";

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn profile_where(&self, clause: &str, value: &str) -> BillingResult<Option<UserProfile>> {
        let sql = format!(
            "SELECT {} FROM user_profiles WHERE {} = $1 LIMIT 1",
            PROFILE_COLUMNS, clause
        );
        let profile = sqlx::query_as::<_, UserProfile>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    /// Read-then-write balance update for databases without the increment function
    async fn increment_token_balance_fallback(
        &self,
        user_id: Uuid,
        amount: i64,
    ) -> BillingResult<i64> {
        let current: Option<(i64,)> =
            sqlx::query_as("SELECT token_balance FROM user_profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let (current,) = current.ok_or_else(|| {
            BillingError::Database(format!("no profile for token purchase user {}", user_id))
        })?;
        let balance = current + amount;

        sqlx::query("UPDATE user_profiles SET token_balance = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(balance)
            .execute(&self.pool)
            .await?;

        Ok(balance)
    }
}

fn is_undefined_function(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_FUNCTION),
        _ => false,
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn is_event_processed(&self, event_id: &str) -> BillingResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM processed_webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str, event_type: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_webhook_log(&self, log: &WebhookLog) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_logs
                (event_id, event_type, status, processing_time_ms, result_message,
                 error_message, stack_trace, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&log.event_id)
        .bind(&log.event_type)
        .bind(log.status.as_str())
        .bind(log.processing_time_ms)
        .bind(&log.result_message)
        .bind(&log.error_message)
        .bind(&log.stack_trace)
        .bind(log.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_error_log(
        &self,
        source: &str,
        message: &str,
        context: serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query("INSERT INTO error_logs (source, message, context) VALUES ($1, $2, $3)")
            .bind(source)
            .bind(message)
            .bind(context)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        let sql = format!("SELECT {} FROM user_profiles WHERE id = $1", PROFILE_COLUMNS);
        let profile = sqlx::query_as::<_, UserProfile>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    async fn find_profile_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserProfile>> {
        self.profile_where("stripe_customer_id", customer_id).await
    }

    async fn find_profile_by_connect_account(
        &self,
        account_id: &str,
    ) -> BillingResult<Option<UserProfile>> {
        self.profile_where("stripe_connect_account_id", account_id).await
    }

    async fn insert_profile(&self, profile: &NewUserProfile) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (id, email, full_name, role)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(profile.id)
        .bind(&profile.email)
        .bind(&profile.full_name)
        .bind(&profile.role)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attach_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_profiles
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND stripe_customer_id IS NULL
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enable_beta_pricing(
        &self,
        user_id: Uuid,
        locked_price_cents: i64,
        started_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_profiles
            SET is_beta_tester = TRUE,
                beta_locked_price_cents = $2,
                beta_started_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(locked_price_cents)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_client(&self, client_id: Uuid) -> BillingResult<Option<ClientRecord>> {
        let client = sqlx::query_as::<_, ClientRecord>(
            "SELECT id, photographer_id, user_id, email, name FROM clients WHERE id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(client)
    }

    async fn link_client_user(&self, client_id: Uuid, user_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE clients SET user_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(client_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_gallery(&self, gallery_id: Uuid) -> BillingResult<Option<GalleryRecord>> {
        let gallery = sqlx::query_as::<_, GalleryRecord>(
            r#"
            SELECT id, photographer_id, client_id, gallery_name, payment_status
            FROM photo_galleries
            WHERE id = $1
            "#,
        )
        .bind(gallery_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(gallery)
    }

    async fn mark_gallery_paid(
        &self,
        gallery_id: Uuid,
        payment_reference: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE photo_galleries
            SET payment_status = 'paid',
                stripe_payment_intent_id = $2,
                paid_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(gallery_id)
        .bind(payment_reference)
        .bind(paid_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let subscription = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(subscription)
    }

    async fn upsert_subscription(
        &self,
        subscription: &SubscriptionUpsert,
    ) -> BillingResult<SubscriptionRecord> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions
                (user_id, gallery_id, stripe_subscription_id, stripe_customer_id, status,
                 plan_type, current_period_start, current_period_end, cancel_at_period_end,
                 canceled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                gallery_id = COALESCE(EXCLUDED.gallery_id, subscriptions.gallery_id),
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                status = EXCLUDED.status,
                plan_type = EXCLUDED.plan_type,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(subscription.user_id)
            .bind(subscription.gallery_id)
            .bind(&subscription.stripe_subscription_id)
            .bind(&subscription.stripe_customer_id)
            .bind(subscription.status.as_str())
            .bind(&subscription.plan_type)
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.cancel_at_period_end)
            .bind(subscription.canceled_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(record)
    }

    async fn cancel_subscription(
        &self,
        stripe_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET status = $2, canceled_at = $3, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(stripe_subscription_id)
            .bind(SubscriptionStatus::Canceled.as_str())
            .bind(canceled_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn record_payment_success(
        &self,
        stripe_subscription_id: &str,
        period: Option<(OffsetDateTime, OffsetDateTime)>,
    ) -> BillingResult<()> {
        let (start, end) = period.unzip();
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                payment_failure_count = 0,
                last_payment_failure_at = NULL,
                access_suspended = FALSE,
                access_suspended_at = NULL,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_payment_failure(
        &self,
        stripe_subscription_id: &str,
        update: &PaymentFailureUpdate,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                payment_failure_count = $3,
                last_payment_failure_at = $4,
                access_suspended = $5,
                access_suspended_at = $6,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(SubscriptionStatus::PastDue.as_str())
        .bind(update.payment_failure_count)
        .bind(update.last_payment_failure_at)
        .bind(update.access_suspended)
        .bind(update.access_suspended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn restore_gallery_subscription(
        &self,
        restore: &SubscriptionRestore,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let (owner, customer) = restore.new_owner.clone().unzip();
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET status = $2,
                user_id = COALESCE($3, user_id),
                stripe_customer_id = COALESCE($4, stripe_customer_id),
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = FALSE,
                canceled_at = NULL,
                payment_failure_count = 0,
                last_payment_failure_at = NULL,
                access_suspended = FALSE,
                access_suspended_at = NULL,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM subscriptions
                WHERE gallery_id = $1
                ORDER BY created_at DESC
                LIMIT 1
            )
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let record = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .bind(restore.gallery_id)
            .bind(SubscriptionStatus::Active.as_str())
            .bind(owner)
            .bind(customer.flatten())
            .bind(restore.period_start)
            .bind(restore.period_end)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn insert_commission(&self, commission: &NewCommission) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO commissions
                (photographer_id, gallery_id, client_email, amount_cents, total_paid_cents,
                 shoot_fee_cents, storage_fee_cents, photovault_commission_cents, payment_type,
                 stripe_payment_intent_id, stripe_transfer_id, status, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'paid', $12)
            "#,
        )
        .bind(commission.photographer_id)
        .bind(commission.gallery_id)
        .bind(&commission.client_email)
        .bind(commission.amount_cents)
        .bind(commission.total_paid_cents)
        .bind(commission.shoot_fee_cents)
        .bind(commission.storage_fee_cents)
        .bind(commission.photovault_commission_cents)
        .bind(commission.payment_type.as_str())
        .bind(&commission.stripe_payment_intent_id)
        .bind(&commission.stripe_transfer_id)
        .bind(commission.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_commission_for_photographer(&self, photographer_id: Uuid) -> BillingResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM commissions WHERE photographer_id = $1 AND status = 'paid')",
        )
        .bind(photographer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn has_commission_for_client(&self, client_email: &str) -> BillingResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM commissions WHERE LOWER(client_email) = LOWER($1) AND status = 'paid')",
        )
        .bind(client_email)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_payment_history(&self, entry: &NewPaymentHistory) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_history
                (stripe_invoice_id, stripe_subscription_id, amount_paid_cents, currency, status, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.stripe_invoice_id)
        .bind(&entry.stripe_subscription_id)
        .bind(entry.amount_paid_cents)
        .bind(&entry.currency)
        .bind(entry.status.as_str())
        .bind(entry.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_payout(&self, payout: &NewPayout) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payouts
                (photographer_id, stripe_payout_id, amount_cents, currency, status, arrival_date, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_payout_id) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(payout.photographer_id)
        .bind(&payout.stripe_payout_id)
        .bind(payout.amount_cents)
        .bind(&payout.currency)
        .bind(&payout.status)
        .bind(payout.arrival_date)
        .bind(&payout.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_token_balance(&self, user_id: Uuid, amount: i64) -> BillingResult<i64> {
        let result: Result<Option<(Option<i64>,)>, sqlx::Error> =
            sqlx::query_as("SELECT increment_token_balance($1, $2)")
                .bind(user_id)
                .bind(amount)
                .fetch_optional(&self.pool)
                .await;

        match result {
            Ok(Some((Some(balance),))) => Ok(balance),
            Ok(_) => Err(BillingError::Database(format!(
                "no profile for token purchase user {}",
                user_id
            ))),
            Err(e) if is_undefined_function(&e) => {
                tracing::warn!(
                    user_id = %user_id,
                    "increment_token_balance() missing, using read-then-write fallback"
                );
                self.increment_token_balance_fallback(user_id, amount).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_token_purchase(
        &self,
        user_id: Uuid,
        amount: i64,
        session_id: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO token_transactions (user_id, amount, kind, stripe_session_id)
            VALUES ($1, $2, 'purchase', $3)
            ON CONFLICT (stripe_session_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_token_purchase(&self, session_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM token_transactions WHERE stripe_session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn photographer_churn_stats(
        &self,
        user_id: Uuid,
    ) -> BillingResult<PhotographerChurnStats> {
        let (lifetime_revenue_cents, client_count, gallery_count): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COALESCE((SELECT SUM(amount_cents) FROM commissions
                              WHERE photographer_id = $1 AND status = 'paid'), 0)::BIGINT,
                    (SELECT COUNT(*) FROM clients WHERE photographer_id = $1),
                    (SELECT COUNT(*) FROM photo_galleries WHERE photographer_id = $1)
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(PhotographerChurnStats {
            lifetime_revenue_cents,
            client_count,
            gallery_count,
        })
    }

    async fn client_churn_stats(&self, user_id: Uuid) -> BillingResult<ClientChurnStats> {
        let (photographer_id, gallery_count): (Option<Uuid>, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT photographer_id FROM clients WHERE user_id = $1
                 ORDER BY created_at ASC LIMIT 1),
                (SELECT COUNT(*) FROM photo_galleries g
                 LEFT JOIN clients c ON c.id = g.client_id
                 WHERE g.user_id = $1 OR c.user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ClientChurnStats {
            photographer_id,
            gallery_count,
        })
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
