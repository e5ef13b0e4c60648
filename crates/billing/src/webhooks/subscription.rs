use super::{churn, HandlerContext};
use crate::error::{BillingError, BillingResult};
use crate::event::{unix_to_datetime, MetadataExt, StripeSubscription};
use crate::models::{SubscriptionStatus, SubscriptionUpsert};

const DEFAULT_PLAN: &str = "monthly";

pub(super) async fn handle_subscription_created(
    ctx: &HandlerContext,
    subscription: StripeSubscription,
) -> BillingResult<String> {
    let record = sync_subscription(ctx, &subscription).await?;
    tracing::info!(
        subscription_id = %subscription.id,
        user_id = %record.user_id,
        status = %record.status,
        "Subscription created"
    );
    Ok(format!(
        "Subscription {} created for user {}",
        subscription.id, record.user_id
    ))
}

pub(super) async fn handle_subscription_updated(
    ctx: &HandlerContext,
    subscription: StripeSubscription,
) -> BillingResult<String> {
    let record = sync_subscription(ctx, &subscription).await?;
    tracing::info!(
        subscription_id = %subscription.id,
        status = %record.status,
        cancel_at_period_end = record.cancel_at_period_end,
        "Subscription updated"
    );
    Ok(format!(
        "Subscription {} updated ({})",
        subscription.id, record.status
    ))
}

pub(super) async fn handle_subscription_deleted(
    ctx: &HandlerContext,
    subscription: StripeSubscription,
) -> BillingResult<String> {
    let canceled_at = subscription
        .canceled_at
        .and_then(unix_to_datetime)
        .unwrap_or(ctx.now);

    let Some(record) = ctx
        .store
        .cancel_subscription(&subscription.id, canceled_at)
        .await?
    else {
        tracing::warn!(
            subscription_id = %subscription.id,
            "Deleted subscription is not tracked locally"
        );
        return Ok(format!(
            "Subscription {} not tracked, nothing to cancel",
            subscription.id
        ));
    };

    churn::spawn_churn_tracking(ctx, record);

    tracing::info!(subscription_id = %subscription.id, "Subscription canceled");
    Ok(format!("Subscription {} canceled", subscription.id))
}

/// Mirror the provider's subscription into the local row.
///
/// The owner must already exist: it was created by checkout or Connect
/// onboarding. An unknown customer fails the event.
async fn sync_subscription(
    ctx: &HandlerContext,
    subscription: &StripeSubscription,
) -> BillingResult<crate::models::SubscriptionRecord> {
    let customer_id = subscription.customer.id();
    let owner = ctx
        .store
        .find_profile_by_customer(customer_id)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))?;

    let period = subscription.billing_period();
    let upsert = SubscriptionUpsert {
        user_id: owner.id,
        gallery_id: subscription.metadata.uuid("galleryId")?,
        stripe_subscription_id: subscription.id.clone(),
        stripe_customer_id: Some(customer_id.to_string()),
        status: SubscriptionStatus::from_stripe(&subscription.status),
        plan_type: subscription
            .metadata
            .text("planType")
            .unwrap_or(DEFAULT_PLAN)
            .to_string(),
        current_period_start: period.map(|(start, _)| start),
        current_period_end: period.map(|(_, end)| end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        canceled_at: subscription.canceled_at.and_then(unix_to_datetime),
    };

    ctx.store.upsert_subscription(&upsert).await
}
