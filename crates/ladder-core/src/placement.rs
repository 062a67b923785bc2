//! Placement Store: per-(track, tier) binary trees of members.
//!
//! A new member goes directly under its referrer when the referrer has an
//! open side. Otherwise the first open position found by a breadth-first
//! scan from the referrer (level by level, left before right) is used.
//! The scan is bounded by a configured depth; running past it is fatal.
//!
//! Planning is a pure read over a [`CascadeStore`]; the planned placement is
//! committed in a [`WriteSet`] so it can share a transaction with the
//! activation that needed it.

use std::collections::{HashSet, VecDeque};

use crate::constants::{ENTRY_TIER, MAX_REFERRER_HOPS};
use crate::error::PlacementError;
use crate::store::{CascadeStore, WriteSet};
use crate::types::{MemberId, Placement, Side, Stamp, TierKey, TreeKey};

/// Outcome of planning an insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlannedPlacement {
    /// The member was already placed in the tree; nothing to write.
    Existing(Placement),
    /// A new placement to commit.
    New(Placement),
}

impl PlannedPlacement {
    pub fn placement(&self) -> &Placement {
        match self {
            Self::Existing(p) | Self::New(p) => p,
        }
    }

    pub fn into_placement(self) -> Placement {
        match self {
            Self::Existing(p) | Self::New(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Read-side tree operations over a store.
pub struct PlacementStore<'a, S: ?Sized> {
    store: &'a S,
    max_scan_depth: u32,
}

impl<'a, S: CascadeStore + ?Sized> PlacementStore<'a, S> {
    pub fn new(store: &'a S, max_scan_depth: u32) -> Self {
        Self { store, max_scan_depth }
    }

    pub fn get(&self, key: &TierKey) -> Result<Option<Placement>, PlacementError> {
        Ok(self.store.placement(key)?)
    }

    /// Like [`get`](Self::get) but a missing placement is an error.
    pub fn require(&self, key: &TierKey) -> Result<Placement, PlacementError> {
        self.get(key)?.ok_or(PlacementError::NotPlaced {
            member: key.member,
            track: key.track,
            tier: key.tier,
        })
    }

    /// Plan the placement of `member` into `tree`.
    ///
    /// The search starts at the nearest member of the referrer chain that is
    /// placed in `tree` (for the entry tier, the referrer itself must be
    /// placed). Without one it starts at the tree root; an empty tree makes
    /// the member its root.
    pub fn plan_insert(
        &self,
        member: MemberId,
        referrer: Option<MemberId>,
        tree: TreeKey,
        stamp: Stamp,
    ) -> Result<PlannedPlacement, PlacementError> {
        if referrer == Some(member) {
            return Err(PlacementError::SelfReferral(member));
        }
        let key = TierKey::new(member, tree.track, tree.tier);
        if let Some(existing) = self.get(&key)? {
            return Ok(PlannedPlacement::Existing(existing));
        }

        let placement = match self.search_start(referrer, tree)? {
            Some(start) => {
                let (parent, side) = self.open_position(&start)?;
                Placement {
                    member_id: member,
                    track: tree.track,
                    tier_no: tree.tier,
                    referrer_id: referrer,
                    tree_parent_id: Some(parent.member_id),
                    side: Some(side),
                    depth: parent.depth + 1,
                    filled: 0,
                    created_at: stamp.created_at,
                    seq: stamp.seq,
                }
            }
            None => Placement {
                member_id: member,
                track: tree.track,
                tier_no: tree.tier,
                referrer_id: referrer,
                tree_parent_id: None,
                side: None,
                depth: 0,
                filled: 0,
                created_at: stamp.created_at,
                seq: stamp.seq,
            },
        };
        Ok(PlannedPlacement::New(placement))
    }

    fn search_start(
        &self,
        referrer: Option<MemberId>,
        tree: TreeKey,
    ) -> Result<Option<Placement>, PlacementError> {
        let mut visited = HashSet::new();
        let mut cursor = referrer;
        while let Some(candidate) = cursor {
            if visited.len() >= MAX_REFERRER_HOPS || !visited.insert(candidate) {
                break;
            }
            if let Some(p) = self.get(&TierKey::new(candidate, tree.track, tree.tier))? {
                return Ok(Some(p));
            }
            let entry = self.get(&TierKey::new(candidate, tree.track, ENTRY_TIER))?;
            if tree.tier == ENTRY_TIER || entry.is_none() {
                return Err(PlacementError::NotRegistered { member: candidate, track: tree.track });
            }
            cursor = entry.and_then(|p| p.referrer_id);
        }

        match self.store.tree_root(&tree)? {
            Some(root) => Ok(Some(self.require(&TierKey::new(root, tree.track, tree.tier))?)),
            None => Ok(None),
        }
    }

    /// First open slot at or below `start`, scanning breadth-first.
    ///
    /// # Errors
    ///
    /// [`PlacementError::Exhausted`] if no slot is open within
    /// `max_scan_depth` levels below `start`.
    pub fn open_position(&self, start: &Placement) -> Result<(Placement, Side), PlacementError> {
        let exhausted = PlacementError::Exhausted {
            start: start.member_id,
            max_depth: self.max_scan_depth,
        };
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(node) = queue.pop_front() {
            if node.depth - start.depth > self.max_scan_depth {
                return Err(exhausted);
            }
            let children = self.store.children(&node.key())?;
            if let Some(side) = children.first_open() {
                return Ok((node, side));
            }
            for child in children.occupants() {
                queue.push_back(self.require(&TierKey::new(child, node.track, node.tier_no))?);
            }
        }
        Err(exhausted)
    }

    /// The placement `n` parent-steps above the member, or `None` if the
    /// root is reached first.
    pub fn ancestor_at(&self, key: &TierKey, n: u32) -> Result<Option<Placement>, PlacementError> {
        let placement = self.require(key)?;
        self.ancestor_of(&placement, n)
    }

    /// Same walk as [`ancestor_at`](Self::ancestor_at) starting from a
    /// placement that may not be committed yet.
    pub fn ancestor_of(&self, placement: &Placement, n: u32) -> Result<Option<Placement>, PlacementError> {
        let mut current = placement.clone();
        for _ in 0..n {
            match current.tree_parent_id {
                Some(parent) => {
                    current = self.require(&TierKey::new(parent, current.track, current.tier_no))?;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Every placement exactly `depth` levels below `ancestor`, in
    /// breadth-first (left-to-right) order.
    pub fn level_below(&self, ancestor: &Placement, depth: u32) -> Result<Vec<Placement>, PlacementError> {
        let mut level = vec![ancestor.clone()];
        for _ in 0..depth {
            let mut next = Vec::with_capacity(level.len() * 2);
            for node in &level {
                for child in self.store.children(&node.key())?.occupants() {
                    next.push(self.require(&TierKey::new(child, node.track, node.tier_no))?);
                }
            }
            if next.is_empty() {
                return Ok(next);
            }
            level = next;
        }
        Ok(level)
    }
}

/// Plan and commit a placement in one call.
///
/// Idempotent: an already placed member gets its existing placement back.
/// Callers that need the placement in a larger transaction use
/// [`PlacementStore::plan_insert`] instead.
pub fn insert<S: CascadeStore + ?Sized>(
    store: &mut S,
    member: MemberId,
    referrer: Option<MemberId>,
    tree: TreeKey,
    created_at: i64,
    max_scan_depth: u32,
) -> Result<Placement, PlacementError> {
    let stamp = Stamp { created_at, seq: store.next_seq()? };
    let planned = PlacementStore::new(&*store, max_scan_depth).plan_insert(member, referrer, tree, stamp)?;
    match planned {
        PlannedPlacement::Existing(p) => Ok(p),
        PlannedPlacement::New(p) => {
            let mut ws = WriteSet::new();
            ws.place(p.clone());
            store.commit(ws)?;
            Ok(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::TrackId;

    const TRACK: TrackId = TrackId(1);
    const ENTRY: TreeKey = TreeKey { track: TRACK, tier: 1 };

    fn join(store: &mut MemoryStore, member: u64, referrer: Option<u64>) -> Placement {
        insert(store, MemberId(member), referrer.map(MemberId), ENTRY, 1_000, 32).unwrap()
    }

    fn key(member: u64, tier: u32) -> TierKey {
        TierKey::new(MemberId(member), TRACK, tier)
    }

    /// Root 1 with 2 and 3 directly under it.
    fn small_tree() -> MemoryStore {
        let mut store = MemoryStore::new();
        join(&mut store, 1, None);
        join(&mut store, 2, Some(1));
        join(&mut store, 3, Some(1));
        store
    }

    #[test]
    fn first_member_becomes_root() {
        let mut store = MemoryStore::new();
        let root = join(&mut store, 1, None);
        assert!(root.is_root());
        assert_eq!(root.depth, 0);
        assert_eq!(root.side, None);
    }

    #[test]
    fn direct_sides_fill_left_then_right() {
        let store = small_tree();
        let ps = PlacementStore::new(&store, 32);
        let two = ps.require(&key(2, 1)).unwrap();
        let three = ps.require(&key(3, 1)).unwrap();
        assert_eq!((two.tree_parent_id, two.side), (Some(MemberId(1)), Some(Side::Left)));
        assert_eq!((three.tree_parent_id, three.side), (Some(MemberId(1)), Some(Side::Right)));
        assert_eq!(ps.require(&key(1, 1)).unwrap().filled, 2);
    }

    #[test]
    fn overflow_takes_shallowest_left_first_slot() {
        let mut store = small_tree();
        let four = join(&mut store, 4, Some(1));
        let five = join(&mut store, 5, Some(1));
        let six = join(&mut store, 6, Some(1));

        assert_eq!((four.tree_parent_id, four.side), (Some(MemberId(2)), Some(Side::Left)));
        assert_eq!((five.tree_parent_id, five.side), (Some(MemberId(2)), Some(Side::Right)));
        assert_eq!((six.tree_parent_id, six.side), (Some(MemberId(3)), Some(Side::Left)));
        assert!(four.is_overflow());
        assert_eq!(four.referrer_id, Some(MemberId(1)));
        assert_eq!(six.depth, 2);
    }

    #[test]
    fn overflow_search_starts_at_referrer_not_root() {
        let mut store = small_tree();
        join(&mut store, 4, Some(3));
        join(&mut store, 5, Some(3));
        let six = join(&mut store, 6, Some(3));
        assert_eq!(six.tree_parent_id, Some(MemberId(4)));
        assert_eq!(six.depth, 3);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut store = small_tree();
        let again = join(&mut store, 2, Some(1));
        assert_eq!(again.side, Some(Side::Left));
        assert_eq!(store.placement_count(), 3);
    }

    #[test]
    fn scan_bound_exceeded_is_exhausted() {
        let mut store = small_tree();
        let err = insert(&mut store, MemberId(4), Some(MemberId(1)), ENTRY, 1_000, 0).unwrap_err();
        assert_eq!(err, PlacementError::Exhausted { start: MemberId(1), max_depth: 0 });
    }

    #[test]
    fn unregistered_referrer_rejected_in_entry_tier() {
        let mut store = small_tree();
        let err = insert(&mut store, MemberId(9), Some(MemberId(77)), ENTRY, 1_000, 32).unwrap_err();
        assert_eq!(err, PlacementError::NotRegistered { member: MemberId(77), track: TRACK });
    }

    #[test]
    fn self_referral_rejected() {
        let mut store = MemoryStore::new();
        let err = insert(&mut store, MemberId(1), Some(MemberId(1)), ENTRY, 1_000, 32).unwrap_err();
        assert_eq!(err, PlacementError::SelfReferral(MemberId(1)));
    }

    #[test]
    fn higher_tier_climbs_referrer_chain() {
        let mut store = small_tree();
        join(&mut store, 4, Some(2));
        let tier2 = TreeKey { track: TRACK, tier: 2 };

        // Empty tier-2 tree: 4 becomes root even though 2 referred it.
        let root = insert(&mut store, MemberId(4), Some(MemberId(2)), tier2, 2_000, 32).unwrap();
        assert!(root.is_root());

        // 2's referrer 1 is not in tier 2, so the search starts at the root.
        let two = insert(&mut store, MemberId(2), Some(MemberId(1)), tier2, 2_001, 32).unwrap();
        assert_eq!(two.tree_parent_id, Some(MemberId(4)));

        // 3 was referred by 1, which is absent from tier 2, so the chain ends
        // at the root again; 4 still has a free right side.
        let three = insert(&mut store, MemberId(3), Some(MemberId(1)), tier2, 2_002, 32).unwrap();
        assert_eq!((three.tree_parent_id, three.side), (Some(MemberId(4)), Some(Side::Right)));

        // A member referred by 2 finds 2 in tier 2 directly.
        join(&mut store, 5, Some(2));
        let five = insert(&mut store, MemberId(5), Some(MemberId(2)), tier2, 2_003, 32).unwrap();
        assert_eq!(five.tree_parent_id, Some(MemberId(2)));
    }

    #[test]
    fn higher_tier_skips_unplaced_referrer_to_grand_referrer() {
        let mut store = small_tree();
        join(&mut store, 4, Some(2));
        let tier2 = TreeKey { track: TRACK, tier: 2 };
        insert(&mut store, MemberId(1), None, tier2, 2_000, 32).unwrap();

        // 4's referrer 2 is not in tier 2; 2's referrer 1 is.
        let four = insert(&mut store, MemberId(4), Some(MemberId(2)), tier2, 2_001, 32).unwrap();
        assert_eq!(four.tree_parent_id, Some(MemberId(1)));
        assert_eq!(four.referrer_id, Some(MemberId(2)));
    }

    #[test]
    fn ancestor_walk_and_root_boundary() {
        let mut store = small_tree();
        join(&mut store, 4, Some(2));
        join(&mut store, 5, Some(4));
        let ps = PlacementStore::new(&store, 32);

        assert_eq!(ps.ancestor_at(&key(5, 1), 0).unwrap().unwrap().member_id, MemberId(5));
        assert_eq!(ps.ancestor_at(&key(5, 1), 1).unwrap().unwrap().member_id, MemberId(4));
        assert_eq!(ps.ancestor_at(&key(5, 1), 3).unwrap().unwrap().member_id, MemberId(1));
        assert_eq!(ps.ancestor_at(&key(5, 1), 4).unwrap(), None);
        assert_eq!(ps.ancestor_at(&key(2, 1), 2).unwrap(), None);
    }

    #[test]
    fn ancestor_of_unplaced_member_is_error() {
        let store = small_tree();
        let ps = PlacementStore::new(&store, 32);
        assert!(matches!(
            ps.ancestor_at(&key(42, 1), 1),
            Err(PlacementError::NotPlaced { .. })
        ));
    }

    #[test]
    fn level_below_expands_full_breadth() {
        let mut store = small_tree();
        for m in 4..=7 {
            join(&mut store, m, Some(1));
        }
        let ps = PlacementStore::new(&store, 32);
        let root = ps.require(&key(1, 1)).unwrap();

        let members = |depth| -> Vec<u64> {
            ps.level_below(&root, depth).unwrap().iter().map(|p| p.member_id.0).collect()
        };
        assert_eq!(members(0), vec![1]);
        assert_eq!(members(1), vec![2, 3]);
        assert_eq!(members(2), vec![4, 5, 6, 7]);
        assert!(members(3).is_empty());
        assert!(members(5).is_empty());
    }
}
