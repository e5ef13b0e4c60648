//! Commission split between photographer and platform
//!
//! Photographers keep the whole shoot fee plus half the storage fee. The
//! platform keeps the other half of the storage fee and absorbs card
//! processing fees out of it, so the photographer's gross never depends on
//! what the processor charged.

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::event::{Metadata, MetadataExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommissionSplit {
    pub total_paid_cents: i64,
    pub shoot_fee_cents: i64,
    pub storage_fee_cents: i64,
    /// Amount owed to the photographer
    pub photographer_gross_cents: i64,
    /// Amount kept by the platform
    pub platform_fee_cents: i64,
}

impl CommissionSplit {
    /// Split a payment made of a shoot fee and a storage fee.
    ///
    /// Half of an odd storage fee rounds up in the photographer's favour.
    pub fn from_fees(shoot_fee_cents: i64, storage_fee_cents: i64) -> Self {
        let platform_fee_cents = storage_fee_cents / 2;
        let photographer_storage_share = storage_fee_cents - platform_fee_cents;

        Self {
            total_paid_cents: shoot_fee_cents + storage_fee_cents,
            shoot_fee_cents,
            storage_fee_cents,
            photographer_gross_cents: shoot_fee_cents + photographer_storage_share,
            platform_fee_cents,
        }
    }

    /// Recurring storage payments: the whole amount is storage
    pub fn recurring(amount_cents: i64) -> Self {
        Self::from_fees(0, amount_cents)
    }

    /// Split for a gallery checkout, read from the session metadata.
    ///
    /// Legacy public checkouts carry `shootFeeCents`/`storageFeeCents` and are
    /// split here. Authenticated checkouts carry the split precomputed in
    /// `photographerPayoutCents`/`photovaultCommissionCents`. A session with
    /// neither shape is treated as a storage-only payment of `amount_total`.
    /// Negative amounts are rejected.
    pub fn from_checkout(metadata: &Metadata, amount_total: i64) -> BillingResult<Self> {
        let shoot = fee_cents(metadata, "shootFeeCents")?;
        let storage = fee_cents(metadata, "storageFeeCents")?;
        let payout = fee_cents(metadata, "photographerPayoutCents")?;
        let commission = fee_cents(metadata, "photovaultCommissionCents")?;

        if let (Some(photographer_gross_cents), Some(platform_fee_cents)) = (payout, commission) {
            return Ok(Self {
                total_paid_cents: amount_total,
                shoot_fee_cents: shoot.unwrap_or(0),
                storage_fee_cents: storage.unwrap_or(0),
                photographer_gross_cents,
                platform_fee_cents,
            });
        }

        let split = match (shoot, storage) {
            (None, None) => Self::recurring(amount_total),
            (shoot, storage) => Self::from_fees(shoot.unwrap_or(0), storage.unwrap_or(0)),
        };

        if split.total_paid_cents != amount_total {
            tracing::warn!(
                metadata_total = split.total_paid_cents,
                amount_total = amount_total,
                "Checkout fee metadata does not add up to the amount charged"
            );
        }

        Ok(Self {
            total_paid_cents: amount_total,
            ..split
        })
    }
}

fn fee_cents(metadata: &Metadata, field: &'static str) -> BillingResult<Option<i64>> {
    match metadata.cents(field)? {
        Some(cents) if cents < 0 => Err(BillingError::InvalidMetadata {
            field,
            value: cents.to_string(),
        }),
        cents => Ok(cents),
    }
}
