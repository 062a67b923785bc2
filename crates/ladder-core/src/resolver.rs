//! Ancestor Resolver: tier N looks exactly N steps up its own tree.

use crate::error::PlacementError;
use crate::placement::PlacementStore;
use crate::store::CascadeStore;
use crate::types::{Placement, TierKey};

pub struct AncestorResolver<'a, S: ?Sized> {
    placements: PlacementStore<'a, S>,
}

impl<'a, S: CascadeStore + ?Sized> AncestorResolver<'a, S> {
    pub fn new(store: &'a S, max_scan_depth: u32) -> Self {
        Self { placements: PlacementStore::new(store, max_scan_depth) }
    }

    /// The ancestor `key.tier` steps above the member in the tier's tree.
    ///
    /// `None` means the member is too close to the root. That is a normal
    /// outcome, not an error.
    pub fn nth_upline(&self, key: &TierKey) -> Result<Option<Placement>, PlacementError> {
        self.placements.ancestor_at(key, key.tier)
    }

    /// [`nth_upline`](Self::nth_upline) for a placement that may still be
    /// waiting to be committed.
    pub fn nth_upline_of(&self, placement: &Placement) -> Result<Option<Placement>, PlacementError> {
        self.placements.ancestor_of(placement, placement.tier_no)
    }
}
