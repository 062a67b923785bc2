//! Eligibility Checker: is a member among the first two placements at a
//! given depth below an ancestor?
//!
//! "First" is creation order, `(created_at, seq)` ascending. The whole level
//! is expanded breadth-first down to the exact depth, not just the
//! ancestor's direct children.

use crate::constants::ELIGIBLE_PER_LEVEL;
use crate::error::PlacementError;
use crate::placement::PlacementStore;
use crate::store::CascadeStore;
use crate::types::{MemberId, Placement};

/// The earliest-created members of a level, at most [`ELIGIBLE_PER_LEVEL`].
///
/// Independent of the order of `level`.
pub fn first_two_of(level: &[Placement]) -> Vec<MemberId> {
    let mut ordered: Vec<&Placement> = level.iter().collect();
    ordered.sort_by_key(|p| (p.order_key(), p.member_id));
    ordered.into_iter().take(ELIGIBLE_PER_LEVEL).map(|p| p.member_id).collect()
}

pub struct EligibilityChecker<'a, S: ?Sized> {
    placements: PlacementStore<'a, S>,
}

impl<'a, S: CascadeStore + ?Sized> EligibilityChecker<'a, S> {
    pub fn new(store: &'a S, max_scan_depth: u32) -> Self {
        Self { placements: PlacementStore::new(store, max_scan_depth) }
    }

    /// The first two members exactly `required_depth` levels below `ancestor`.
    ///
    /// `pending` is a placement planned in the same write set as the unlock
    /// being routed. It joins the level if it sits at the right depth.
    pub fn first_two(
        &self,
        ancestor: &Placement,
        required_depth: u32,
        pending: Option<&Placement>,
    ) -> Result<Vec<MemberId>, PlacementError> {
        let mut level = self.placements.level_below(ancestor, required_depth)?;
        if let Some(p) = pending {
            let at_depth = p.tree() == ancestor.tree() && p.depth == ancestor.depth + required_depth;
            if at_depth && level.iter().all(|q| q.member_id != p.member_id) {
                level.push(p.clone());
            }
        }
        Ok(first_two_of(&level))
    }

    pub fn is_first_or_second(
        &self,
        member: MemberId,
        ancestor: &Placement,
        required_depth: u32,
        pending: Option<&Placement>,
    ) -> Result<bool, PlacementError> {
        Ok(self.first_two(ancestor, required_depth, pending)?.contains(&member))
    }
}
