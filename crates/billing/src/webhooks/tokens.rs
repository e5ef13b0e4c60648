use super::HandlerContext;
use crate::error::{BillingError, BillingResult};
use crate::event::{CheckoutSession, MetadataExt};

/// Credit purchased tokens to the buyer's balance.
///
/// The ledger row keyed by checkout session is written first and acts as the
/// claim, so overlapping deliveries of the same session credit at most once.
/// If the balance update then fails the claim is released for the retry.
pub(super) async fn handle_token_purchase(
    ctx: &HandlerContext,
    session: &CheckoutSession,
) -> BillingResult<String> {
    let metadata = &session.metadata;
    let user_id = metadata
        .uuid("userId")?
        .ok_or(BillingError::MissingMetadata("userId"))?;
    let amount = metadata
        .cents("tokenAmount")?
        .ok_or(BillingError::MissingMetadata("tokenAmount"))?;

    if amount <= 0 {
        return Err(BillingError::InvalidMetadata {
            field: "tokenAmount",
            value: amount.to_string(),
        });
    }

    if !ctx
        .store
        .claim_token_purchase(user_id, amount, &session.id)
        .await?
    {
        tracing::info!(
            session_id = %session.id,
            user_id = %user_id,
            "Token purchase already credited"
        );
        return Ok(format!("Token purchase {} already credited", session.id));
    }

    let balance = match ctx.store.increment_token_balance(user_id, amount).await {
        Ok(balance) => balance,
        Err(e) => {
            tracing::error!(
                session_id = %session.id,
                user_id = %user_id,
                amount = amount,
                error = %e,
                "Token balance update failed, releasing ledger claim"
            );
            if let Err(release_err) = ctx.store.release_token_purchase(&session.id).await {
                tracing::error!(
                    session_id = %session.id,
                    error = %release_err,
                    "Failed to release token purchase claim"
                );
            }
            return Err(e);
        }
    };

    tracing::info!(
        user_id = %user_id,
        amount = amount,
        balance = balance,
        "Tokens credited"
    );
    Ok(format!(
        "Credited {} tokens to user {} (balance {})",
        amount, user_id, balance
    ))
}
