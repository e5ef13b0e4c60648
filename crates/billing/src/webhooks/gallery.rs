//! Gallery checkout: the buyer pays upfront for a gallery and a year of storage
//!
//! Money and access writes (gallery status, subscription grant, identity
//! creation) fail the webhook. Client linking, transfer lookup, commission
//! bookkeeping, analytics and email are best-effort.
//!
//! The buyer is resolved before anything is written, and notifications go
//! out only after every fatal write has succeeded, so a retried delivery
//! never repeats them.

use time::Duration;
use uuid::Uuid;

use super::HandlerContext;
use crate::analytics::{
    AnalyticsEvent, CLIENT_PAYMENT_COMPLETED, GALLERY_PAID, PHOTOGRAPHER_PAYMENT_RECEIVED,
};
use crate::commission::CommissionSplit;
use crate::email::BillingEmail;
use crate::error::{BillingError, BillingResult};
use crate::event::{CheckoutSession, MetadataExt};
use crate::identity::{generate_temporary_password, NewIdentity};
use crate::models::{
    ClientRecord, NewCommission, NewUserProfile, PaymentType, SubscriptionStatus,
    SubscriptionUpsert,
};

pub(crate) const ANNUAL_PLAN: &str = "annual_upfront";
const ANNUAL_ACCESS_DAYS: i64 = 365;

/// Identity the gallery purchase is attached to
#[derive(Debug)]
struct Buyer {
    user_id: Uuid,
    /// Set when the identity was created by this checkout
    temporary_password: Option<String>,
}

pub(super) async fn handle_gallery_checkout(
    ctx: &HandlerContext,
    session: &CheckoutSession,
) -> BillingResult<String> {
    let metadata = &session.metadata;
    let gallery_id = metadata
        .uuid("galleryId")?
        .ok_or(BillingError::MissingMetadata("galleryId"))?;
    let is_public = metadata.flag("isPublicCheckout");
    let payment_reference = session.payment_reference().to_string();

    let gallery = ctx
        .store
        .find_gallery(gallery_id)
        .await?
        .ok_or_else(|| BillingError::GalleryNotFound(gallery_id.to_string()))?;
    let photographer_id = metadata
        .uuid("photographerId")?
        .unwrap_or(gallery.photographer_id);

    let client = match metadata.uuid("clientId")?.or(gallery.client_id) {
        Some(client_id) => ctx.store.find_client(client_id).await?,
        None => None,
    };

    let email = resolve_email(client.as_ref(), session);
    let name = session
        .customer_name()
        .map(str::to_string)
        .or_else(|| client.as_ref().and_then(|c| c.name.clone()));

    let amount_total = session.amount_total.unwrap_or(0);
    let split = CommissionSplit::from_checkout(metadata, amount_total)?;

    let buyer = match metadata.uuid("userId")? {
        Some(user_id) => Some(Buyer {
            user_id,
            temporary_password: None,
        }),
        None => match email.as_deref() {
            Some(email) => resolve_buyer(ctx, email, name.as_deref(), is_public).await?,
            None => None,
        },
    };
    let buyer = buyer.ok_or(BillingError::MissingMetadata("userId"))?;

    if !ctx
        .store
        .mark_gallery_paid(gallery_id, &payment_reference, ctx.now)
        .await?
    {
        return Err(BillingError::GalleryNotFound(gallery_id.to_string()));
    }
    tracing::info!(
        gallery_id = %gallery_id,
        payment_reference = %payment_reference,
        "Gallery marked paid"
    );

    let access = SubscriptionUpsert {
        user_id: buyer.user_id,
        gallery_id: Some(gallery_id),
        stripe_subscription_id: format!("annual_{}", payment_reference),
        stripe_customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
        status: SubscriptionStatus::Active,
        plan_type: ANNUAL_PLAN.to_string(),
        current_period_start: Some(ctx.now),
        current_period_end: Some(ctx.now + Duration::days(ANNUAL_ACCESS_DAYS)),
        cancel_at_period_end: false,
        canceled_at: None,
    };
    ctx.store.upsert_subscription(&access).await?;

    if let Some(client) = client.as_ref() {
        if client.user_id != Some(buyer.user_id) {
            if let Err(e) = ctx.store.link_client_user(client.id, buyer.user_id).await {
                tracing::warn!(
                    client_id = %client.id,
                    user_id = %buyer.user_id,
                    error = %e,
                    "Failed to link client record to buyer"
                );
            }
        }
    }

    if let Some(customer) = session.customer.as_ref() {
        if let Err(e) = ctx.store.attach_customer_id(buyer.user_id, customer.id()).await {
            tracing::warn!(user_id = %buyer.user_id, error = %e, "Failed to store Stripe customer id");
        }
    }

    let transfer_id = lookup_transfer_id(ctx, session).await;

    let first_for_photographer = !ctx
        .store
        .has_commission_for_photographer(photographer_id)
        .await
        .unwrap_or(true);
    let first_for_client = match email.as_deref() {
        Some(email) => !ctx
            .store
            .has_commission_for_client(email)
            .await
            .unwrap_or(true),
        None => false,
    };

    let commission = NewCommission {
        photographer_id,
        gallery_id: Some(gallery_id),
        client_email: email.clone(),
        amount_cents: split.photographer_gross_cents,
        total_paid_cents: split.total_paid_cents,
        shoot_fee_cents: split.shoot_fee_cents,
        storage_fee_cents: split.storage_fee_cents,
        photovault_commission_cents: split.platform_fee_cents,
        payment_type: PaymentType::Upfront,
        stripe_payment_intent_id: Some(payment_reference.clone()),
        stripe_transfer_id: transfer_id,
        paid_at: ctx.now,
    };
    if let Err(e) = ctx.store.insert_commission(&commission).await {
        tracing::warn!(
            gallery_id = %gallery_id,
            payment_reference = %payment_reference,
            error = %e,
            "Failed to record commission (possible duplicate)"
        );
    }

    track_payment(
        ctx,
        buyer.user_id,
        photographer_id,
        gallery_id,
        &split,
        first_for_client,
        first_for_photographer,
    );

    if let (Some(password), Some(email)) = (buyer.temporary_password.clone(), email.clone()) {
        ctx.send_email(BillingEmail::WelcomeWithPassword {
            to: email.clone(),
            name: name
                .clone()
                .unwrap_or_else(|| email.split('@').next().unwrap_or("there").to_string()),
            gallery_name: Some(gallery.gallery_name.clone()),
            temporary_password: password,
            login_url: ctx.app_url("/login"),
        });
    }

    Ok(format!(
        "Gallery {} paid: {} cents to photographer {}, {} cents platform fee",
        gallery_id, split.photographer_gross_cents, photographer_id, split.platform_fee_cents
    ))
}

/// Client record email first, then the email Stripe captured, then metadata
fn resolve_email(client: Option<&ClientRecord>, session: &CheckoutSession) -> Option<String> {
    client
        .map(|c| c.email.as_str())
        .filter(|e| !e.trim().is_empty())
        .or_else(|| session.captured_email())
        .or_else(|| session.metadata.text("clientEmail"))
        .map(|e| e.trim().to_lowercase())
}

/// Find the buyer's identity, creating one for public checkouts.
///
/// A concurrent checkout for the same email may create the identity between
/// our lookup and our create; the provider then reports a conflict and the
/// identity it created is used instead.
async fn resolve_buyer(
    ctx: &HandlerContext,
    email: &str,
    name: Option<&str>,
    is_public: bool,
) -> BillingResult<Option<Buyer>> {
    if let Some(existing) = ctx.identity.find_by_email(email).await? {
        return Ok(Some(Buyer {
            user_id: existing.id,
            temporary_password: None,
        }));
    }

    if !is_public {
        tracing::warn!("Authenticated gallery checkout without a matching identity");
        return Ok(None);
    }

    let password = generate_temporary_password();
    let request = NewIdentity {
        email: email.to_string(),
        password: password.clone(),
        full_name: name.map(str::to_string),
        role: "client".to_string(),
    };

    let created = match ctx.identity.create(&request).await {
        Ok(identity) => identity,
        Err(BillingError::IdentityAlreadyExists(_)) => {
            tracing::info!("Identity created concurrently, resolving existing user");
            let existing = ctx.identity.find_by_email(email).await?.ok_or_else(|| {
                BillingError::Identity("identity reported as existing but not found".to_string())
            })?;
            return Ok(Some(Buyer {
                user_id: existing.id,
                temporary_password: None,
            }));
        }
        Err(e) => return Err(e),
    };

    tracing::info!(user_id = %created.id, "Provisioned identity for public checkout");

    let profile = NewUserProfile {
        id: created.id,
        email: email.to_string(),
        full_name: name.map(str::to_string),
        role: "client".to_string(),
    };
    if let Err(e) = ctx.store.insert_profile(&profile).await {
        // A signup trigger may have created the row already
        tracing::warn!(user_id = %created.id, error = %e, "Profile insert skipped");
    }

    Ok(Some(Buyer {
        user_id: created.id,
        temporary_password: Some(password),
    }))
}

async fn lookup_transfer_id(ctx: &HandlerContext, session: &CheckoutSession) -> Option<String> {
    let payment_intent = session.payment_intent.as_ref()?;
    match ctx
        .stripe
        .payment_intent_transfer_id(payment_intent.id())
        .await
    {
        Ok(transfer) => transfer,
        Err(e) => {
            tracing::warn!(
                payment_intent = %payment_intent.id(),
                error = %e,
                "Could not retrieve transfer id"
            );
            None
        }
    }
}

fn track_payment(
    ctx: &HandlerContext,
    buyer: Uuid,
    photographer_id: Uuid,
    gallery_id: Uuid,
    split: &CommissionSplit,
    first_for_client: bool,
    first_for_photographer: bool,
) {
    ctx.track(AnalyticsEvent::new(
        buyer,
        CLIENT_PAYMENT_COMPLETED,
        serde_json::json!({
            "gallery_id": gallery_id,
            "photographer_id": photographer_id,
            "amount_cents": split.total_paid_cents,
            "payment_type": PaymentType::Upfront.as_str(),
            "is_first_payment": first_for_client,
        }),
    ));

    ctx.track(AnalyticsEvent::new(
        photographer_id,
        PHOTOGRAPHER_PAYMENT_RECEIVED,
        serde_json::json!({
            "gallery_id": gallery_id,
            "amount_cents": split.photographer_gross_cents,
            "total_paid_cents": split.total_paid_cents,
            "is_first_payment": first_for_photographer,
        }),
    ));

    ctx.track(AnalyticsEvent::new(
        photographer_id,
        GALLERY_PAID,
        serde_json::json!({
            "gallery_id": gallery_id,
            "amount_cents": split.total_paid_cents,
            "shoot_fee_cents": split.shoot_fee_cents,
            "storage_fee_cents": split.storage_fee_cents,
        }),
    ));
}
