//! Churn analytics for canceled subscriptions
//!
//! Runs after the webhook has answered. The aggregate queries are bounded by
//! a timeout; when it expires the event still fires with zeroed stats.
//! Failures here cannot reach the provider, so they go to `error_logs`.

use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;

use super::HandlerContext;
use crate::analytics::{AnalyticsEvent, AnalyticsSink, CLIENT_CHURNED, PHOTOGRAPHER_CHURNED};
use crate::error::BillingResult;
use crate::models::SubscriptionRecord;
use crate::store::BillingStore;

const ERROR_SOURCE: &str = "churn_tracking";

pub(super) fn spawn_churn_tracking(ctx: &HandlerContext, subscription: SubscriptionRecord) {
    let store = ctx.store.clone();
    let analytics = ctx.analytics.clone();
    let limit = ctx.settings.churn_stats_timeout;
    let now = ctx.now;
    let event_id = ctx.event_id.clone();

    ctx.tracker.spawn(async move {
        let result = track_churn(store.as_ref(), analytics.as_ref(), &subscription, now, limit).await;

        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                subscription_id = %subscription.stripe_subscription_id,
                error = %e,
                "Churn tracking failed"
            );
            let context = serde_json::json!({
                "event_id": event_id,
                "subscription_id": subscription.stripe_subscription_id,
                "user_id": subscription.user_id,
            });
            if let Err(log_err) = store
                .insert_error_log(ERROR_SOURCE, &e.to_string(), context)
                .await
            {
                tracing::warn!(error = %log_err, "Failed to write churn error log");
            }
        }
    });
}

async fn track_churn(
    store: &dyn BillingStore,
    analytics: &dyn AnalyticsSink,
    subscription: &SubscriptionRecord,
    now: OffsetDateTime,
    limit: Duration,
) -> BillingResult<()> {
    let user_id = subscription.user_id;
    let tenure_days = (now - subscription.created_at).whole_days().max(0);
    let is_photographer = store
        .find_profile(user_id)
        .await?
        .is_some_and(|p| p.is_photographer());

    let event = if is_photographer {
        let stats = bounded(limit, "photographer", store.photographer_churn_stats(user_id)).await?;
        AnalyticsEvent::new(
            user_id,
            PHOTOGRAPHER_CHURNED,
            serde_json::json!({
                "tenure_days": tenure_days,
                "lifetime_revenue_cents": stats.lifetime_revenue_cents,
                "client_count": stats.client_count,
                "gallery_count": stats.gallery_count,
                "plan_type": subscription.plan_type,
            }),
        )
    } else {
        let stats = bounded(limit, "client", store.client_churn_stats(user_id)).await?;
        AnalyticsEvent::new(
            user_id,
            CLIENT_CHURNED,
            serde_json::json!({
                "tenure_days": tenure_days,
                "photographer_id": stats.photographer_id,
                "gallery_count": stats.gallery_count,
                "plan_type": subscription.plan_type,
            }),
        )
    };

    analytics.capture(&event).await
}

/// Await an aggregate query, substituting zeroed stats on timeout
async fn bounded<T, F>(limit: Duration, kind: &str, query: F) -> BillingResult<T>
where
    T: Default,
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(limit, query).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                kind = kind,
                timeout_ms = limit.as_millis() as u64,
                "Churn stats query timed out, reporting zeroes"
            );
            Ok(T::default())
        }
    }
}

