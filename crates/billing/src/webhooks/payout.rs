use super::HandlerContext;
use crate::error::BillingResult;
use crate::event::{unix_to_datetime, StripePayout};
use crate::models::NewPayout;

/// Record a payout to a photographer's connected account.
///
/// Payouts for accounts we have not mapped to a photographer yet are
/// expected while onboarding syncs, and are acknowledged without a write.
pub(super) async fn handle_payout_created(
    ctx: &HandlerContext,
    account: Option<&str>,
    payout: StripePayout,
) -> BillingResult<String> {
    let Some(account) = account else {
        tracing::info!(payout_id = %payout.id, "Payout is not for a connected account, ignoring");
        return Ok(format!("Payout {} has no connected account", payout.id));
    };

    let Some(photographer) = ctx.store.find_profile_by_connect_account(account).await? else {
        tracing::warn!(
            payout_id = %payout.id,
            account = %account,
            "No photographer mapped to connected account yet"
        );
        return Ok(format!(
            "Payout {} for unknown account {} skipped",
            payout.id, account
        ));
    };

    ctx.store
        .insert_payout(&NewPayout {
            photographer_id: photographer.id,
            stripe_payout_id: payout.id.clone(),
            amount_cents: payout.amount,
            currency: payout.currency.clone(),
            status: payout.status.clone().unwrap_or_else(|| "pending".to_string()),
            arrival_date: payout.arrival_date.and_then(unix_to_datetime),
            description: payout.description.clone(),
        })
        .await?;

    tracing::info!(
        payout_id = %payout.id,
        photographer_id = %photographer.id,
        amount_cents = payout.amount,
        "Payout recorded"
    );
    Ok(format!(
        "Payout {} of {} cents recorded for photographer {}",
        payout.id, payout.amount, photographer.id
    ))
}
