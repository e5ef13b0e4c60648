use time::Duration;

use super::{invoice, HandlerContext};
use crate::commission::CommissionSplit;
use crate::error::{BillingError, BillingResult};
use crate::event::{CheckoutSession, MetadataExt};
use crate::models::{NewCommission, PaymentType, SubscriptionRestore};

/// Access window bought by the flat reactivation fee
pub(crate) const REACTIVATION_ACCESS_DAYS: i64 = 30;

/// Restore a suspended gallery after the flat reactivation fee is paid
pub(super) async fn handle_reactivation(
    ctx: &HandlerContext,
    session: &CheckoutSession,
) -> BillingResult<String> {
    let metadata = &session.metadata;
    let gallery_id = metadata
        .uuid("galleryId")?
        .ok_or(BillingError::MissingMetadata("galleryId"))?;
    let user_id = metadata
        .uuid("userId")?
        .ok_or(BillingError::MissingMetadata("userId"))?;
    let payment_reference = session.payment_reference().to_string();

    let restore = SubscriptionRestore {
        gallery_id,
        new_owner: None,
        period_start: ctx.now,
        period_end: ctx.now + Duration::days(REACTIVATION_ACCESS_DAYS),
    };
    let subscription = ctx
        .store
        .restore_gallery_subscription(&restore)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(format!("gallery {}", gallery_id)))?;

    if !ctx
        .store
        .mark_gallery_paid(gallery_id, &payment_reference, ctx.now)
        .await?
    {
        tracing::warn!(gallery_id = %gallery_id, "Reactivated subscription has no gallery row");
    }

    let photographer_id = match metadata.uuid("photographerId")? {
        Some(id) => Some(id),
        None => ctx
            .store
            .find_gallery(gallery_id)
            .await?
            .map(|g| g.photographer_id),
    };

    match photographer_id {
        Some(photographer_id) => {
            let split = CommissionSplit::recurring(session.amount_total.unwrap_or(0));
            let commission = NewCommission {
                photographer_id,
                gallery_id: Some(gallery_id),
                client_email: session.captured_email().map(str::to_lowercase),
                amount_cents: split.photographer_gross_cents,
                total_paid_cents: split.total_paid_cents,
                shoot_fee_cents: 0,
                storage_fee_cents: split.storage_fee_cents,
                photovault_commission_cents: split.platform_fee_cents,
                payment_type: PaymentType::Reactivation,
                stripe_payment_intent_id: Some(payment_reference.clone()),
                stripe_transfer_id: None,
                paid_at: ctx.now,
            };
            if let Err(e) = ctx.store.insert_commission(&commission).await {
                tracing::warn!(
                    gallery_id = %gallery_id,
                    error = %e,
                    "Failed to record reactivation commission (possible duplicate)"
                );
            }
        }
        None => tracing::warn!(
            gallery_id = %gallery_id,
            "No photographer for reactivated gallery, commission skipped"
        ),
    }

    invoice::send_restoration_notice(ctx, &subscription).await;

    tracing::info!(
        gallery_id = %gallery_id,
        user_id = %user_id,
        "Gallery access reactivated"
    );
    Ok(format!(
        "Gallery {} reactivated for {} days",
        gallery_id, REACTIVATION_ACCESS_DAYS
    ))
}
