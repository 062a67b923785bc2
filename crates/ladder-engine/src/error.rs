//! Engine-level errors.
use thiserror::Error;

use ladder_core::error::{CatalogError, LedgerError, PlacementError, RouteError, StoreError};
use ladder_core::types::{TierNo, TrackId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")] Load(String),
    #[error("invalid configuration: {0}")] Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CascadeError {
    #[error("unlock fee must be positive")] NonPositiveFee,
    #[error("tier {tier} is not offered on track {track}")] TierNotOffered { track: TrackId, tier: TierNo },
    #[error("unresolved event not found: {0}")] UnknownEvent(u64),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Placement(#[from] PlacementError),
    #[error(transparent)] Ledger(#[from] LedgerError),
    #[error(transparent)] Catalog(#[from] CatalogError),
    #[error(transparent)] Route(#[from] RouteError),
    #[error(transparent)] Config(#[from] ConfigError),
}

impl CascadeError {
    /// The storage failure underneath, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) | Self::Placement(PlacementError::Store(e)) | Self::Ledger(LedgerError::Store(e)) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::error::Conflict;

    #[test]
    fn store_error_found_through_wrappers() {
        let transient = StoreError::Transient("busy".into());
        let err = CascadeError::from(PlacementError::Store(transient.clone()));
        assert_eq!(err.store_error(), Some(&transient));

        let conflict = StoreError::Conflict(Conflict::UnknownEvent(3));
        let err = CascadeError::from(LedgerError::Store(conflict.clone()));
        assert!(err.store_error().is_some_and(StoreError::is_conflict));

        assert_eq!(CascadeError::NonPositiveFee.store_error(), None);
    }

    #[test]
    fn display_is_transparent_for_wrapped_errors() {
        let err = CascadeError::from(RouteError::Unavailable("pool offline".into()));
        assert_eq!(err.to_string(), "gateway unavailable: pool offline");
    }
}
