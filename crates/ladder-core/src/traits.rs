//! Narrow interfaces to the collaborators the cascade does not own.
//!
//! - [`TierCatalog`]: tier pricing, read-only
//! - [`PoolGateway`]: the percentage-based pool mechanism fees fall back to
//! - [`DirectCredit`]: the payout rail for entry-tier and fallback payments
//!
//! The core never interprets receipts beyond recording their ids.

use crate::error::{CatalogError, RouteError};
use crate::types::{Amount, MemberId, PayoutReason, RouteReason, TierNo, TrackId};

/// Opaque acknowledgement returned by an external fee destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub id: String,
}

impl Receipt {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Read-only tier pricing.
pub trait TierCatalog: Send + Sync {
    /// Price of a tier, or `None` if the track does not offer it.
    fn price(&self, track: TrackId, tier: TierNo) -> Result<Option<Amount>, CatalogError>;

    /// Whether the track offers the tier.
    ///
    /// Default implementation delegates to [`price`](Self::price).
    fn is_offered(&self, track: TrackId, tier: TierNo) -> Result<bool, CatalogError> {
        Ok(self.price(track, tier)?.is_some())
    }
}

/// The external pool mechanism invoked when a fee has no eligible holder.
pub trait PoolGateway: Send + Sync {
    /// Forward `amount` paid by `member` for `tier` into the pool.
    ///
    /// `reference` is stable for a given activation, so the gateway can
    /// deduplicate a forward retried after reconciliation.
    fn forward(
        &self,
        member: MemberId,
        amount: Amount,
        track: TrackId,
        tier: TierNo,
        reason: RouteReason,
        reference: &str,
    ) -> Result<Receipt, RouteError>;
}

/// The direct payout rail.
pub trait DirectCredit: Send + Sync {
    /// Pay `amount` to `recipient`'s wallet in `currency`.
    fn pay(
        &self,
        recipient: MemberId,
        amount: Amount,
        currency: &str,
        reason: PayoutReason,
        reference: &str,
    ) -> Result<Receipt, RouteError>;
}
