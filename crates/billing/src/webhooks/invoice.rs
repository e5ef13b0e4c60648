//! Invoice lifecycle: recurring payments and the dunning grace period

use super::HandlerContext;
use crate::analytics::{AnalyticsEvent, PAYMENT_FAILED};
use crate::commission::CommissionSplit;
use crate::email::BillingEmail;
use crate::error::{BillingError, BillingResult};
use crate::event::{MetadataExt, StripeInvoice};
use crate::grace;
use crate::models::{
    NewCommission, NewPaymentHistory, PaymentStatus, PaymentType, SubscriptionRecord,
};

pub(super) async fn handle_payment_succeeded(
    ctx: &HandlerContext,
    invoice: StripeInvoice,
) -> BillingResult<String> {
    let Some(subscription_id) = invoice.subscription_id().map(str::to_string) else {
        tracing::info!(invoice_id = %invoice.id, "Invoice is not for a subscription, ignoring");
        return Ok(format!("Invoice {} has no subscription", invoice.id));
    };

    let subscription = ctx
        .store
        .find_subscription(&subscription_id)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.clone()))?;

    ctx.store
        .record_payment_success(&subscription_id, invoice.service_period())
        .await?;

    if subscription.access_suspended {
        tracing::info!(
            subscription_id = %subscription_id,
            "Payment received for suspended subscription, access restored"
        );
        send_restoration_notice(ctx, &subscription).await;
    }

    ctx.store
        .insert_payment_history(&NewPaymentHistory {
            stripe_invoice_id: Some(invoice.id.clone()),
            stripe_subscription_id: Some(subscription_id.clone()),
            amount_paid_cents: invoice.amount_paid,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Succeeded,
            paid_at: ctx.now,
        })
        .await?;

    record_recurring_commission(ctx, &invoice, &subscription_id, &subscription).await;

    Ok(format!(
        "Invoice {} paid for subscription {} ({} cents)",
        invoice.id, subscription_id, invoice.amount_paid
    ))
}

pub(super) async fn handle_payment_failed(
    ctx: &HandlerContext,
    invoice: StripeInvoice,
) -> BillingResult<String> {
    let Some(subscription_id) = invoice.subscription_id().map(str::to_string) else {
        tracing::info!(invoice_id = %invoice.id, "Failed invoice is not for a subscription, ignoring");
        return Ok(format!("Invoice {} has no subscription", invoice.id));
    };

    let subscription = ctx
        .store
        .find_subscription(&subscription_id)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.clone()))?;

    let outcome = grace::register_failure(&subscription, ctx.now);
    ctx.store
        .record_payment_failure(&subscription_id, &outcome.update)
        .await?;

    if outcome.newly_suspended {
        tracing::warn!(
            subscription_id = %subscription_id,
            failure_count = outcome.update.payment_failure_count,
            "Grace period exhausted, gallery access suspended"
        );
    } else {
        tracing::info!(
            subscription_id = %subscription_id,
            failure_count = outcome.update.payment_failure_count,
            days_remaining = outcome.days_remaining,
            "Payment failed, subscription in grace period"
        );
    }

    ctx.store
        .insert_payment_history(&NewPaymentHistory {
            stripe_invoice_id: Some(invoice.id.clone()),
            stripe_subscription_id: Some(subscription_id.clone()),
            amount_paid_cents: 0,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Failed,
            paid_at: ctx.now,
        })
        .await?;

    ctx.track(AnalyticsEvent::new(
        subscription.user_id,
        PAYMENT_FAILED,
        serde_json::json!({
            "subscription_id": subscription_id,
            "invoice_id": invoice.id,
            "amount_due_cents": invoice.amount_due,
            "failure_count": outcome.update.payment_failure_count,
            "days_remaining": outcome.days_remaining,
            "access_suspended": outcome.update.access_suspended,
        }),
    ));

    send_dunning_notice(ctx, &invoice, &subscription, &outcome).await;

    Ok(format!(
        "Payment failure {} recorded for subscription {} ({} days of grace left{})",
        outcome.update.payment_failure_count,
        subscription_id,
        outcome.days_remaining,
        if outcome.update.access_suspended {
            ", access suspended"
        } else {
            ""
        }
    ))
}

/// Recurring revenue commission, split 50/50 like the storage part of an
/// upfront payment. The owning photographer only lives in the provider's
/// subscription metadata. Nothing in here fails the event.
async fn record_recurring_commission(
    ctx: &HandlerContext,
    invoice: &StripeInvoice,
    subscription_id: &str,
    subscription: &SubscriptionRecord,
) {
    if invoice.amount_paid <= 0 {
        return;
    }

    let metadata = match ctx.stripe.subscription_metadata(subscription_id).await {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Could not fetch subscription metadata, commission skipped"
            );
            return;
        }
    };

    let Some(photographer_id) = metadata.uuid("photographerId").ok().flatten() else {
        tracing::info!(
            subscription_id = %subscription_id,
            "Subscription has no photographer, no commission to record"
        );
        return;
    };

    let gallery_id = metadata
        .uuid("galleryId")
        .ok()
        .flatten()
        .or(subscription.gallery_id);

    let client = match metadata.uuid("clientId").ok().flatten() {
        Some(client_id) => ctx.store.find_client(client_id).await.ok().flatten(),
        None => None,
    };
    let client_email = client
        .as_ref()
        .map(|c| c.email.clone())
        .or_else(|| invoice.customer_email.clone());

    let transfer_id = match invoice.charge.as_ref() {
        Some(charge) => ctx
            .stripe
            .charge_transfer_id(charge.id())
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(charge_id = %charge.id(), error = %e, "Could not retrieve transfer id");
                None
            }),
        None => None,
    };

    let split = CommissionSplit::recurring(invoice.amount_paid);
    let payment_reference = invoice
        .payment_intent
        .as_ref()
        .map(|p| p.id().to_string())
        .unwrap_or_else(|| invoice.id.clone());

    let commission = NewCommission {
        photographer_id,
        gallery_id,
        client_email: client_email.clone(),
        amount_cents: split.photographer_gross_cents,
        total_paid_cents: split.total_paid_cents,
        shoot_fee_cents: 0,
        storage_fee_cents: split.storage_fee_cents,
        photovault_commission_cents: split.platform_fee_cents,
        payment_type: PaymentType::Monthly,
        stripe_payment_intent_id: Some(payment_reference),
        stripe_transfer_id: transfer_id,
        paid_at: ctx.now,
    };

    if let Err(e) = ctx.store.insert_commission(&commission).await {
        tracing::warn!(
            invoice_id = %invoice.id,
            error = %e,
            "Failed to record recurring commission (possible duplicate)"
        );
        return;
    }

    if invoice.is_first_payment() {
        if let Some(email) = client_email {
            let gallery_name = match gallery_id {
                Some(id) => ctx
                    .store
                    .find_gallery(id)
                    .await
                    .ok()
                    .flatten()
                    .map(|g| g.gallery_name),
                None => None,
            };
            ctx.send_email(BillingEmail::PaymentReceipt {
                name: client
                    .and_then(|c| c.name)
                    .unwrap_or_else(|| email.split('@').next().unwrap_or("there").to_string()),
                to: email,
                amount_cents: invoice.amount_paid,
                currency: invoice.currency.clone(),
                gallery_name,
            });
        }
    }
}

/// Tell the owner their access is back. Each lookup may come back empty, in
/// which case the notice is sent with less detail or skipped.
pub(super) async fn send_restoration_notice(ctx: &HandlerContext, subscription: &SubscriptionRecord) {
    let owner = ctx
        .store
        .find_profile(subscription.user_id)
        .await
        .ok()
        .flatten();
    let Some((email, name)) = owner.and_then(|p| {
        let name = p.display_name();
        p.email.map(|email| (email, name))
    }) else {
        tracing::info!(
            user_id = %subscription.user_id,
            "No email on file, restoration notice skipped"
        );
        return;
    };

    let gallery = match subscription.gallery_id {
        Some(id) => ctx.store.find_gallery(id).await.ok().flatten(),
        None => None,
    };
    let photographer_name = match gallery.as_ref() {
        Some(g) => ctx
            .store
            .find_profile(g.photographer_id)
            .await
            .ok()
            .flatten()
            .map(|p| p.display_name()),
        None => None,
    };

    ctx.send_email(BillingEmail::AccessRestored {
        to: email,
        name,
        gallery_name: gallery.map(|g| g.gallery_name),
        photographer_name,
        gallery_url: ctx.app_url("/client/galleries"),
    });
}

async fn send_dunning_notice(
    ctx: &HandlerContext,
    invoice: &StripeInvoice,
    subscription: &SubscriptionRecord,
    outcome: &grace::FailureOutcome,
) {
    let owner = ctx
        .store
        .find_profile(subscription.user_id)
        .await
        .ok()
        .flatten();
    let name = owner.as_ref().map(|p| p.display_name());
    let email = owner
        .and_then(|p| p.email)
        .or_else(|| invoice.customer_email.clone());

    let Some(email) = email else {
        tracing::info!(
            subscription_id = %subscription.stripe_subscription_id,
            "No email for dunning notice"
        );
        return;
    };

    ctx.send_email(BillingEmail::PaymentFailed {
        name: name.unwrap_or_else(|| "there".to_string()),
        to: email,
        amount_due_cents: invoice.amount_due,
        currency: invoice.currency.clone(),
        days_remaining: outcome.days_remaining,
        months_remaining: outcome.months_remaining,
        portal_url: ctx.app_url("/client/billing"),
    });
}
