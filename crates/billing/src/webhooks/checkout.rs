//! `checkout.session.completed` routing
//!
//! Sessions are created by our own checkout code, so their metadata is
//! trusted to say which flow the payment belongs to.

use super::{family, gallery, reactivation, tokens, HandlerContext};
use crate::error::BillingResult;
use crate::event::{CheckoutSession, MetadataExt};

pub(super) async fn handle_checkout_completed(
    ctx: &HandlerContext,
    session: CheckoutSession,
) -> BillingResult<String> {
    let metadata = &session.metadata;

    match metadata.text("purchaseType") {
        Some("tokens") => return tokens::handle_token_purchase(ctx, &session).await,
        Some("subscription") => {
            tracing::info!(
                session_id = %session.id,
                "Subscription checkout completed, waiting for customer.subscription.created"
            );
            return Ok(format!(
                "Subscription checkout {} deferred to subscription events",
                session.id
            ));
        }
        _ => {}
    }

    let checkout_type = metadata.text("type");
    match checkout_type {
        Some("family_takeover") => return family::handle_family_takeover(ctx, &session).await,
        Some("reactivation") => return reactivation::handle_reactivation(ctx, &session).await,
        _ => {}
    }

    let is_gallery = metadata.flag("isPublicCheckout") || checkout_type == Some("gallery_payment");
    if is_gallery && metadata.text("galleryId").is_some() {
        return gallery::handle_gallery_checkout(ctx, &session).await;
    }

    tracing::info!(
        session_id = %session.id,
        checkout_type = ?checkout_type,
        "Checkout session did not match any payment flow, ignoring"
    );
    Ok(format!(
        "Checkout session {} has no matching payment flow",
        session.id
    ))
}
