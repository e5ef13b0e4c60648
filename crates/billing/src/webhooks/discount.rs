use super::HandlerContext;
use crate::email::BillingEmail;
use crate::error::{BillingError, BillingResult};
use crate::event::StripeDiscount;

/// Enrol a photographer in the beta program when the beta coupon is applied.
///
/// Every other coupon is ignored.
pub(super) async fn handle_discount_created(
    ctx: &HandlerContext,
    discount: StripeDiscount,
) -> BillingResult<String> {
    let coupon_id = discount.coupon_id().unwrap_or_default();
    if coupon_id != ctx.settings.beta_coupon_id {
        tracing::debug!(coupon_id = %coupon_id, "Discount is not the beta coupon, ignoring");
        return Ok(format!("Coupon {} ignored", coupon_id));
    }

    let Some(customer_id) = discount.customer.as_ref().map(|c| c.id().to_string()) else {
        tracing::warn!("Beta coupon discount without a customer, ignoring");
        return Ok("Beta coupon discount has no customer".to_string());
    };

    let profile = ctx
        .store
        .find_profile_by_customer(&customer_id)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(customer_id.clone()))?;

    if !profile.is_photographer() {
        tracing::info!(
            user_id = %profile.id,
            role = %profile.role,
            "Beta coupon applied to a non-photographer, ignoring"
        );
        return Ok(format!("User {} is not a photographer", profile.id));
    }

    let locked_price = ctx.settings.beta_locked_price_cents;
    ctx.store
        .enable_beta_pricing(profile.id, locked_price, ctx.now)
        .await?;

    tracing::info!(
        user_id = %profile.id,
        locked_price_cents = locked_price,
        "Photographer enrolled in beta program"
    );

    let stripe = ctx.stripe.clone();
    let mailer = ctx.mailer.clone();
    let dashboard_url = ctx.app_url("/photographer/dashboard");
    let name = profile.display_name();
    let fallback_email = profile.email.clone();
    ctx.spawn_detached("beta_welcome_email", async move {
        let email = match stripe.customer_email(&customer_id).await {
            Ok(Some(email)) => Some(email),
            Ok(None) => fallback_email,
            Err(e) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "Customer lookup failed");
                fallback_email
            }
        };
        let Some(to) = email else {
            return Ok(());
        };
        mailer
            .send(&BillingEmail::BetaWelcome {
                to,
                name,
                locked_price_cents: locked_price,
                dashboard_url,
            })
            .await
    });

    Ok(format!(
        "Photographer {} enrolled in beta at {} cents",
        profile.id, locked_price
    ))
}
