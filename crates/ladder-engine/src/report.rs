//! What a cascade did, step by step.

use ladder_core::types::{ActivationSource, Amount, FeeRoute, TierKey, UnresolvedEvent};

/// The result of one cascade step. All of these are normal outcomes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Activated {
        key: TierKey,
        fee: Amount,
        source: ActivationSource,
        auto: bool,
        route: FeeRoute,
    },
    /// The tier was already unlocked; nothing written.
    AlreadyActivated { key: TierKey },
    /// Holding balance does not cover the tier yet.
    InsufficientHolding { key: TierKey, have: Amount, need: Amount },
    /// The catalog has no price for the tier.
    TierNotOffered { key: TierKey },
}

impl StepOutcome {
    pub fn key(&self) -> &TierKey {
        match self {
            Self::Activated { key, .. }
            | Self::AlreadyActivated { key }
            | Self::InsufficientHolding { key, .. }
            | Self::TierNotOffered { key } => key,
        }
    }

    pub fn is_activated(&self) -> bool {
        matches!(self, Self::Activated { .. })
    }
}

/// Acknowledgement from an external fee destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteReceipt {
    pub key: TierKey,
    pub route: FeeRoute,
    pub amount: Amount,
    pub reference: String,
    pub receipt_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Outcomes in the order the steps ran.
    pub steps: Vec<StepOutcome>,
    pub receipts: Vec<RouteReceipt>,
    /// Events raised for reconciliation during this cascade.
    pub unresolved: Vec<UnresolvedEvent>,
    /// Previously raised events settled by this call.
    pub resolved: Vec<u64>,
}

impl CascadeReport {
    /// Keys activated, in order.
    pub fn activated(&self) -> impl Iterator<Item = &TierKey> {
        self.steps.iter().filter(|s| s.is_activated()).map(StepOutcome::key)
    }

    pub fn activation_count(&self) -> usize {
        self.activated().count()
    }

    pub fn outcome_for(&self, key: &TierKey) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.key() == key)
    }

    /// Whether every money movement in the cascade completed.
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}
