use time::Duration;

use super::HandlerContext;
use crate::error::{BillingError, BillingResult};
use crate::event::{CheckoutSession, MetadataExt};
use crate::models::{NewPaymentHistory, PaymentStatus, SubscriptionRestore};

const TAKEOVER_ACCESS_DAYS: i64 = 365;

/// A household member takes over paying for a gallery.
///
/// The gallery's subscription moves to the new payer and is reactivated
/// for a year from now.
pub(super) async fn handle_family_takeover(
    ctx: &HandlerContext,
    session: &CheckoutSession,
) -> BillingResult<String> {
    let metadata = &session.metadata;
    let gallery_id = metadata
        .uuid("galleryId")?
        .ok_or(BillingError::MissingMetadata("galleryId"))?;
    let new_payer = metadata
        .uuid("newPayerUserId")?
        .ok_or(BillingError::MissingMetadata("newPayerUserId"))?;
    let previous_payer = metadata.uuid("previousPayerUserId")?;
    let customer_id = session.customer.as_ref().map(|c| c.id().to_string());

    let restore = SubscriptionRestore {
        gallery_id,
        new_owner: Some((new_payer, customer_id.clone())),
        period_start: ctx.now,
        period_end: ctx.now + Duration::days(TAKEOVER_ACCESS_DAYS),
    };
    let subscription = ctx
        .store
        .restore_gallery_subscription(&restore)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(format!("gallery {}", gallery_id)))?;

    ctx.store
        .insert_payment_history(&NewPaymentHistory {
            stripe_invoice_id: None,
            stripe_subscription_id: Some(subscription.stripe_subscription_id.clone()),
            amount_paid_cents: session.amount_total.unwrap_or(0),
            currency: session.currency.clone().unwrap_or_else(|| "usd".to_string()),
            status: PaymentStatus::Succeeded,
            paid_at: ctx.now,
        })
        .await?;

    if let Some(customer_id) = customer_id.as_deref() {
        if let Err(e) = ctx.store.attach_customer_id(new_payer, customer_id).await {
            tracing::warn!(user_id = %new_payer, error = %e, "Failed to store Stripe customer id");
        }
    }

    tracing::info!(
        gallery_id = %gallery_id,
        new_payer = %new_payer,
        previous_payer = ?previous_payer,
        "Gallery billing transferred"
    );

    Ok(match previous_payer {
        Some(previous) => format!(
            "Gallery {} billing transferred from {} to {}",
            gallery_id, previous, new_payer
        ),
        None => format!("Gallery {} billing transferred to {}", gallery_id, new_payer),
    })
}
