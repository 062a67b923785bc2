//! Fee routing: where an unlock's fee goes, and delivering it when the
//! destination is external.
//!
//! | Tier | Condition | Route |
//! |---|---|---|
//! | 1 | has referrer | direct payout to referrer |
//! | 1 | no referrer | fallback account, else pool (`no-ancestor`) |
//! | N ≥ 2 | no N-th ancestor | pool (`no-ancestor`) or fallback account, per config |
//! | N ≥ 2 | not first-or-second | pool (`not-eligible`) |
//! | N ≥ 2 | tier N+1 not offered | pool (`no-next-tier`) |
//! | N ≥ 2 | otherwise | credit ancestor's holding for tier N+1 |
//!
//! A route that cannot be decided is the caller's to handle; the engine
//! journals such a fee for the pool (`routing-failed`).

use tracing::debug;

use ladder_core::constants::ENTRY_TIER;
use ladder_core::eligibility::EligibilityChecker;
use ladder_core::error::RouteError;
use ladder_core::resolver::AncestorResolver;
use ladder_core::store::CascadeStore;
use ladder_core::traits::{DirectCredit, PoolGateway, Receipt, TierCatalog};
use ladder_core::types::{
    Amount, FeeRoute, PayoutReason, Placement, RouteReason, TierKey, UnresolvedKind,
};

use crate::config::{EngineConfig, NoAncestorRoute};
use crate::error::CascadeError;

/// Stable reference for an external call: hex BLAKE3 of the key and a label.
///
/// The same activation always yields the same reference, so a gateway can
/// deduplicate a call replayed from the reconciliation journal.
pub fn reference(key: &TierKey, label: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&key.member.to_be_bytes());
    hasher.update(&key.track.0.to_be_bytes());
    hasher.update(&key.tier.to_be_bytes());
    hasher.update(label.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Decides [`FeeRoute`]s against a store snapshot.
pub struct Router<'a, S: ?Sized> {
    store: &'a S,
    catalog: &'a dyn TierCatalog,
    config: &'a EngineConfig,
}

impl<'a, S: CascadeStore + ?Sized> Router<'a, S> {
    pub fn new(store: &'a S, catalog: &'a dyn TierCatalog, config: &'a EngineConfig) -> Self {
        Self { store, catalog, config }
    }

    /// Route the fee for unlocking `placement`'s tier.
    ///
    /// `pending` is set when `placement` is planned in the same write set
    /// and not yet visible in the store.
    pub fn route(&self, placement: &Placement, pending: bool) -> Result<FeeRoute, CascadeError> {
        let key = placement.key();
        if key.tier == ENTRY_TIER {
            let route = match placement.referrer_id {
                Some(referrer) => FeeRoute::Direct { recipient: referrer, reason: PayoutReason::Referral },
                None => self.fallback_or_pool(),
            };
            debug!(%key, %route, "entry-tier fee routed");
            return Ok(route);
        }

        let depth = self.config.max_scan_depth;
        let Some(ancestor) = AncestorResolver::new(self.store, depth).nth_upline_of(placement)? else {
            let route = match self.config.no_ancestor_route {
                NoAncestorRoute::Pool => FeeRoute::Pool { reason: RouteReason::NoAncestor },
                NoAncestorRoute::FallbackAccount => self.fallback_or_pool(),
            };
            debug!(%key, %route, "no ancestor at tier distance");
            return Ok(route);
        };

        let eligible = EligibilityChecker::new(self.store, depth).is_first_or_second(
            key.member,
            &ancestor,
            key.tier,
            pending.then_some(placement),
        )?;
        if !eligible {
            debug!(%key, ancestor = %ancestor.member_id, "not first or second at depth");
            return Ok(FeeRoute::Pool { reason: RouteReason::NotEligible });
        }

        let funds_tier = key.tier + 1;
        if !self.catalog.is_offered(key.track, funds_tier)? {
            debug!(%key, funds_tier, "ancestor's next tier not offered");
            return Ok(FeeRoute::Pool { reason: RouteReason::NoNextTier });
        }

        debug!(%key, ancestor = %ancestor.member_id, funds_tier, "fee credited to ancestor holding");
        Ok(FeeRoute::Holding { ancestor: ancestor.member_id, funds_tier })
    }

    fn fallback_or_pool(&self) -> FeeRoute {
        match self.config.fallback_account {
            Some(recipient) => FeeRoute::Direct { recipient, reason: PayoutReason::FallbackAccount },
            None => FeeRoute::Pool { reason: RouteReason::NoAncestor },
        }
    }
}

/// Deliver an external route. Holding routes are settled by the ledger
/// credit and never reach the gateways.
pub fn dispatch(
    pool: &dyn PoolGateway,
    direct: &dyn DirectCredit,
    currency: &str,
    key: &TierKey,
    amount: Amount,
    route: &FeeRoute,
    reference: &str,
) -> Result<Receipt, RouteError> {
    match *route {
        FeeRoute::Pool { reason } => pool.forward(key.member, amount, key.track, key.tier, reason, reference),
        FeeRoute::Direct { recipient, reason } => direct.pay(recipient, amount, currency, reason, reference),
        FeeRoute::Holding { .. } => Ok(Receipt::new(reference)),
    }
}

/// Journal kind for a failed external route.
pub fn unresolved_kind(route: &FeeRoute) -> Option<UnresolvedKind> {
    match *route {
        FeeRoute::Pool { reason } => Some(UnresolvedKind::PoolForward { reason }),
        FeeRoute::Direct { recipient, reason } => Some(UnresolvedKind::DirectPayout { recipient, reason }),
        FeeRoute::Holding { .. } => None,
    }
}

/// The route a journaled failure was trying to deliver.
pub fn route_of(kind: &UnresolvedKind) -> Option<FeeRoute> {
    match *kind {
        UnresolvedKind::PoolForward { reason } => Some(FeeRoute::Pool { reason }),
        UnresolvedKind::DirectPayout { recipient, reason } => Some(FeeRoute::Direct { recipient, reason }),
        UnresolvedKind::PendingUnlock | UnresolvedKind::PendingAutoUnlock => None,
    }
}
