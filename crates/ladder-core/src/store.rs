//! Cascade state storage interface and in-memory implementation.
//!
//! Provides the [`CascadeStore`] trait over the three persisted collections
//! (placements, activations, holding entries) plus the reconciliation
//! journal. The [`MemoryStore`] is suitable for tests and embedding; the
//! persistent store uses RocksDB (ladder-store).
//!
//! All mutation goes through [`CascadeStore::commit`], which applies a
//! [`WriteSet`] atomically after re-validating it against current state.
//! That commit-time check is the compare-and-swap that keeps two concurrent
//! cascades from double-placing, double-activating, or overdrawing a key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Conflict, StoreError};
use crate::ledger::net_units;
use crate::types::{
    Activation, Children, Direction, HoldingEntry, MemberId, Placement, Side, TierKey, TrackId,
    TreeKey, UnresolvedEvent,
};

/// A batch of writes applied all-or-nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSet {
    /// New placements. A parent placed in the same set must come first.
    pub placements: Vec<Placement>,
    pub activations: Vec<Activation>,
    /// Ledger lines, validated in order.
    pub entries: Vec<HoldingEntry>,
    /// Events surfaced for reconciliation.
    pub raised: Vec<UnresolvedEvent>,
    /// Ids of previously raised events that are now settled.
    pub resolved: Vec<u64>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
            && self.activations.is_empty()
            && self.entries.is_empty()
            && self.raised.is_empty()
            && self.resolved.is_empty()
    }

    pub fn place(&mut self, placement: Placement) -> &mut Self {
        self.placements.push(placement);
        self
    }

    pub fn activate(&mut self, activation: Activation) -> &mut Self {
        self.activations.push(activation);
        self
    }

    pub fn append(&mut self, entry: HoldingEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn raise(&mut self, event: UnresolvedEvent) -> &mut Self {
        self.raised.push(event);
        self
    }

    pub fn resolve(&mut self, id: u64) -> &mut Self {
        self.resolved.push(id);
        self
    }
}

/// Counts of what a commit applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub placements: usize,
    pub activations: usize,
    pub entries: usize,
    pub raised: usize,
    pub resolved: usize,
}

impl From<&WriteSet> for CommitSummary {
    fn from(writes: &WriteSet) -> Self {
        Self {
            placements: writes.placements.len(),
            activations: writes.activations.len(),
            entries: writes.entries.len(),
            raised: writes.raised.len(),
            resolved: writes.resolved.len(),
        }
    }
}

/// Mutable cascade state storage.
///
/// Not internally synchronized for writes. Callers share a store behind a
/// `RwLock` and commit under the write lock.
pub trait CascadeStore: Send + Sync {
    /// Look up a member's placement in one tree.
    fn placement(&self, key: &TierKey) -> Result<Option<Placement>, StoreError>;

    /// Whether the member is placed in the tree.
    ///
    /// Default implementation delegates to [`placement`](Self::placement).
    fn is_placed(&self, key: &TierKey) -> Result<bool, StoreError> {
        Ok(self.placement(key)?.is_some())
    }

    /// Occupants of `parent`'s child slots. Empty if `parent` has none.
    fn children(&self, parent: &TierKey) -> Result<Children, StoreError>;

    /// The parentless placement of a tree, if the tree exists.
    fn tree_root(&self, tree: &TreeKey) -> Result<Option<MemberId>, StoreError>;

    /// Every placement of a tree, in creation order.
    fn placements_in_tree(&self, tree: &TreeKey) -> Result<Vec<Placement>, StoreError>;

    /// Look up the activation for a key.
    fn activation(&self, key: &TierKey) -> Result<Option<Activation>, StoreError>;

    /// Whether the key has been unlocked.
    ///
    /// Default implementation delegates to [`activation`](Self::activation).
    fn is_activated(&self, key: &TierKey) -> Result<bool, StoreError> {
        Ok(self.activation(key)?.is_some())
    }

    /// A member's activations in one track, ordered by tier.
    fn activations_for(&self, member: MemberId, track: TrackId)
        -> Result<Vec<Activation>, StoreError>;

    /// All ledger lines for a key, in write order.
    fn holding_entries(&self, key: &TierKey) -> Result<Vec<HoldingEntry>, StoreError>;

    /// Events awaiting reconciliation, oldest first.
    fn unresolved_events(&self) -> Result<Vec<UnresolvedEvent>, StoreError>;

    /// Look up one unresolved event.
    ///
    /// Default implementation scans [`unresolved_events`](Self::unresolved_events).
    fn unresolved_event(&self, id: u64) -> Result<Option<UnresolvedEvent>, StoreError> {
        Ok(self.unresolved_events()?.into_iter().find(|e| e.id == id))
    }

    /// Allocate the next write-order sequence number. Strictly increasing.
    fn next_seq(&self) -> Result<u64, StoreError>;

    /// Validate and apply a write set atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the set no longer fits current state
    ///   (see [`validate_write_set`]); nothing is applied
    /// - [`StoreError::Transient`] / [`StoreError::Backend`] on I/O failure
    fn commit(&mut self, writes: WriteSet) -> Result<CommitSummary, StoreError>;
}

/// Check a write set against a store's current state.
///
/// Shared by every [`CascadeStore`] implementation so the commit-time rules
/// are identical across backends:
/// - a placed member is not placed again; a parent side is not reused;
///   a parentless placement only goes into an empty tree
/// - a key is activated at most once
/// - a debit never exceeds the balance, counting credits earlier in the set
/// - only known events are resolved
pub fn validate_write_set<S: CascadeStore + ?Sized>(
    store: &S,
    writes: &WriteSet,
) -> Result<(), StoreError> {
    let mut placed: HashSet<TierKey> = HashSet::new();
    let mut taken: HashSet<(TierKey, Side)> = HashSet::new();
    let mut rooted: HashSet<TreeKey> = HashSet::new();

    for p in &writes.placements {
        let key = p.key();
        if placed.contains(&key) || store.is_placed(&key)? {
            return Err(Conflict::AlreadyPlaced {
                member: p.member_id,
                track: p.track,
                tier: p.tier_no,
            }
            .into());
        }

        match (p.tree_parent_id, p.side) {
            (Some(parent), Some(side)) => {
                let parent_key = TierKey::new(parent, p.track, p.tier_no);
                if !placed.contains(&parent_key) && !store.is_placed(&parent_key)? {
                    return Err(Conflict::MissingParent {
                        parent,
                        track: p.track,
                        tier: p.tier_no,
                    }
                    .into());
                }
                if taken.contains(&(parent_key, side))
                    || store.children(&parent_key)?.get(side).is_some()
                {
                    return Err(Conflict::SlotTaken {
                        parent,
                        side,
                        track: p.track,
                        tier: p.tier_no,
                    }
                    .into());
                }
                taken.insert((parent_key, side));
            }
            (None, _) => {
                let tree = p.tree();
                if rooted.contains(&tree) || store.tree_root(&tree)?.is_some() {
                    return Err(Conflict::RootTaken { track: p.track, tier: p.tier_no }.into());
                }
                rooted.insert(tree);
            }
            (Some(parent), None) => {
                return Err(StoreError::Codec(format!(
                    "placement of {} under {parent} has no side",
                    p.member_id
                )));
            }
        }
        placed.insert(key);
    }

    let mut activated: HashSet<TierKey> = HashSet::new();
    for a in &writes.activations {
        let key = a.key();
        if !activated.insert(key) || store.is_activated(&key)? {
            return Err(Conflict::AlreadyActivated {
                member: a.member_id,
                track: a.track,
                tier: a.tier_no,
            }
            .into());
        }
    }

    let mut running: HashMap<TierKey, i128> = HashMap::new();
    for entry in &writes.entries {
        let key = entry.key();
        let balance = match running.get(&key) {
            Some(b) => *b,
            None => net_units(&store.holding_entries(&key)?),
        };
        let amount = i128::from(entry.amount.units());
        let next = match entry.direction {
            Direction::Credit => balance + amount,
            Direction::Debit => {
                if amount > balance {
                    return Err(Conflict::Overdraft {
                        member: entry.member_id,
                        track: entry.track,
                        tier: entry.tier_no,
                        have: balance.max(0) as u64,
                        need: entry.amount.units(),
                    }
                    .into());
                }
                balance - amount
            }
        };
        running.insert(key, next);
    }

    for id in &writes.resolved {
        if store.unresolved_event(*id)?.is_none() {
            return Err(Conflict::UnknownEvent(*id).into());
        }
    }

    Ok(())
}

/// In-memory cascade storage.
///
/// Stores everything in `HashMap`s with no persistence.
#[derive(Debug)]
pub struct MemoryStore {
    placements: HashMap<TierKey, Placement>,
    /// Parent key → occupants of its two slots.
    children: HashMap<TierKey, Children>,
    roots: HashMap<TreeKey, MemberId>,
    activations: HashMap<TierKey, Activation>,
    /// Append-only ledger lines per key.
    ledger: HashMap<TierKey, Vec<HoldingEntry>>,
    unresolved: BTreeMap<u64, UnresolvedEvent>,
    /// Last allocated sequence number.
    seq: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            placements: HashMap::new(),
            children: HashMap::new(),
            roots: HashMap::new(),
            activations: HashMap::new(),
            ledger: HashMap::new(),
            unresolved: BTreeMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of placements across all trees.
    pub fn placement_count(&self) -> usize {
        self.placements.len()
    }

    /// Number of activations across all members.
    pub fn activation_count(&self) -> usize {
        self.activations.len()
    }

    /// Number of ledger lines across all keys.
    pub fn entry_count(&self) -> usize {
        self.ledger.values().map(Vec::len).sum()
    }

    fn apply_placement(&mut self, placement: Placement) {
        let key = placement.key();
        match (placement.tree_parent_id, placement.side) {
            (Some(parent), Some(side)) => {
                let parent_key = TierKey::new(parent, placement.track, placement.tier_no);
                self.children.entry(parent_key).or_default().set(side, key.member);
                if let Some(parent_placement) = self.placements.get_mut(&parent_key) {
                    parent_placement.filled = parent_placement.filled.saturating_add(1);
                }
            }
            _ => {
                self.roots.insert(key.tree(), key.member);
            }
        }
        self.placements.insert(key, placement);
    }
}

impl CascadeStore for MemoryStore {
    fn placement(&self, key: &TierKey) -> Result<Option<Placement>, StoreError> {
        Ok(self.placements.get(key).cloned())
    }

    fn children(&self, parent: &TierKey) -> Result<Children, StoreError> {
        Ok(self.children.get(parent).copied().unwrap_or_default())
    }

    fn tree_root(&self, tree: &TreeKey) -> Result<Option<MemberId>, StoreError> {
        Ok(self.roots.get(tree).copied())
    }

    fn placements_in_tree(&self, tree: &TreeKey) -> Result<Vec<Placement>, StoreError> {
        let mut out: Vec<Placement> = self
            .placements
            .values()
            .filter(|p| p.tree() == *tree)
            .cloned()
            .collect();
        out.sort_by_key(Placement::order_key);
        Ok(out)
    }

    fn activation(&self, key: &TierKey) -> Result<Option<Activation>, StoreError> {
        Ok(self.activations.get(key).cloned())
    }

    fn activations_for(
        &self,
        member: MemberId,
        track: TrackId,
    ) -> Result<Vec<Activation>, StoreError> {
        let mut out: Vec<Activation> = self
            .activations
            .values()
            .filter(|a| a.member_id == member && a.track == track)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.tier_no);
        Ok(out)
    }

    fn holding_entries(&self, key: &TierKey) -> Result<Vec<HoldingEntry>, StoreError> {
        Ok(self.ledger.get(key).cloned().unwrap_or_default())
    }

    fn unresolved_events(&self) -> Result<Vec<UnresolvedEvent>, StoreError> {
        Ok(self.unresolved.values().cloned().collect())
    }

    fn unresolved_event(&self, id: u64) -> Result<Option<UnresolvedEvent>, StoreError> {
        Ok(self.unresolved.get(&id).cloned())
    }

    fn next_seq(&self) -> Result<u64, StoreError> {
        Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn commit(&mut self, writes: WriteSet) -> Result<CommitSummary, StoreError> {
        validate_write_set(self, &writes)?;
        let summary = CommitSummary::from(&writes);

        for placement in writes.placements {
            self.apply_placement(placement);
        }
        for activation in writes.activations {
            self.activations.insert(activation.key(), activation);
        }
        for entry in writes.entries {
            self.ledger.entry(entry.key()).or_default().push(entry);
        }
        for event in writes.raised {
            self.unresolved.insert(event.id, event);
        }
        for id in writes.resolved {
            self.unresolved.remove(&id);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ActivationSource, Amount, FeeRoute, RouteReason, Side, UnresolvedKind,
    };

    const TRACK: TrackId = TrackId(1);

    fn placement(member: u64, parent: Option<(u64, Side)>, tier: u32, seq: u64) -> Placement {
        Placement {
            member_id: MemberId(member),
            track: TRACK,
            tier_no: tier,
            referrer_id: parent.map(|(p, _)| MemberId(p)),
            tree_parent_id: parent.map(|(p, _)| MemberId(p)),
            side: parent.map(|(_, s)| s),
            depth: u32::from(parent.is_some()),
            filled: 0,
            created_at: 1_000,
            seq,
        }
    }

    fn activation(member: u64, tier: u32) -> Activation {
        Activation {
            member_id: MemberId(member),
            track: TRACK,
            tier_no: tier,
            fee_paid: Amount(100),
            is_auto_triggered: false,
            source: ActivationSource::DirectPayment,
            route: FeeRoute::Pool { reason: RouteReason::NoAncestor },
            completed_at: 1_000,
        }
    }

    fn entry(member: u64, tier: u32, direction: Direction, units: u64, seq: u64) -> HoldingEntry {
        HoldingEntry {
            member_id: MemberId(member),
            track: TRACK,
            tier_no: tier,
            direction,
            amount: Amount(units),
            origin_member_id: MemberId(99),
            created_at: 1_000,
            seq,
        }
    }

    fn event(id: u64) -> UnresolvedEvent {
        UnresolvedEvent {
            id,
            member_id: MemberId(5),
            track: TRACK,
            tier_no: 2,
            amount: Amount(100),
            kind: UnresolvedKind::PoolForward { reason: RouteReason::NotEligible },
            reference: "ref".into(),
            detail: "gateway down".into(),
            raised_at: 1_000,
        }
    }

    fn store_with_root() -> MemoryStore {
        let mut store = MemoryStore::new();
        let mut ws = WriteSet::new();
        ws.place(placement(1, None, 1, 1));
        store.commit(ws).unwrap();
        store
    }

    #[test]
    fn root_then_children_update_index_and_counter() {
        let mut store = store_with_root();
        let mut ws = WriteSet::new();
        ws.place(placement(2, Some((1, Side::Left)), 1, 2))
            .place(placement(3, Some((1, Side::Right)), 1, 3));
        let summary = store.commit(ws).unwrap();
        assert_eq!(summary.placements, 2);

        let root_key = TierKey::new(MemberId(1), TRACK, 1);
        let children = store.children(&root_key).unwrap();
        assert_eq!(children.left, Some(MemberId(2)));
        assert_eq!(children.right, Some(MemberId(3)));
        assert_eq!(store.placement(&root_key).unwrap().unwrap().filled, 2);
        assert_eq!(
            store.tree_root(&TreeKey { track: TRACK, tier: 1 }).unwrap(),
            Some(MemberId(1))
        );
        assert_eq!(store.placement_count(), 3);
    }

    #[test]
    fn second_root_rejected() {
        let mut store = store_with_root();
        let mut ws = WriteSet::new();
        ws.place(placement(9, None, 1, 2));
        let err = store.commit(ws).unwrap_err();
        assert_eq!(err, StoreError::Conflict(Conflict::RootTaken { track: TRACK, tier: 1 }));
    }

    #[test]
    fn taken_slot_rejected_and_nothing_applied() {
        let mut store = store_with_root();
        let mut ws = WriteSet::new();
        ws.place(placement(2, Some((1, Side::Left)), 1, 2));
        store.commit(ws).unwrap();

        let mut ws = WriteSet::new();
        ws.activate(activation(7, 1))
            .place(placement(3, Some((1, Side::Left)), 1, 3));
        let err = store.commit(ws).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(Conflict::SlotTaken { side: Side::Left, .. })));
        assert_eq!(store.activation_count(), 0, "failed commit must apply nothing");
        assert_eq!(store.placement_count(), 2);
    }

    #[test]
    fn same_slot_twice_in_one_set_rejected() {
        let mut store = store_with_root();
        let mut ws = WriteSet::new();
        ws.place(placement(2, Some((1, Side::Left)), 1, 2))
            .place(placement(3, Some((1, Side::Left)), 1, 3));
        assert!(store.commit(ws).unwrap_err().is_conflict());
    }

    #[test]
    fn duplicate_member_rejected() {
        let mut store = store_with_root();
        let mut ws = WriteSet::new();
        ws.place(placement(1, Some((1, Side::Left)), 1, 2));
        assert!(matches!(
            store.commit(ws).unwrap_err(),
            StoreError::Conflict(Conflict::AlreadyPlaced { .. })
        ));
    }

    #[test]
    fn missing_parent_rejected() {
        let mut store = store_with_root();
        let mut ws = WriteSet::new();
        ws.place(placement(4, Some((42, Side::Left)), 1, 2));
        assert!(matches!(
            store.commit(ws).unwrap_err(),
            StoreError::Conflict(Conflict::MissingParent { .. })
        ));
    }

    #[test]
    fn parent_and_child_in_same_set() {
        let mut store = MemoryStore::new();
        let mut ws = WriteSet::new();
        ws.place(placement(1, None, 2, 1))
            .place(placement(2, Some((1, Side::Left)), 2, 2));
        store.commit(ws).unwrap();
        let root = store.placement(&TierKey::new(MemberId(1), TRACK, 2)).unwrap().unwrap();
        assert_eq!(root.filled, 1);
    }

    #[test]
    fn activation_is_unique() {
        let mut store = MemoryStore::new();
        let mut ws = WriteSet::new();
        ws.activate(activation(1, 2));
        store.commit(ws.clone()).unwrap();
        assert!(matches!(
            store.commit(ws).unwrap_err(),
            StoreError::Conflict(Conflict::AlreadyActivated { .. })
        ));

        let mut twice = WriteSet::new();
        twice.activate(activation(2, 2)).activate(activation(2, 2));
        assert!(store.commit(twice).unwrap_err().is_conflict());
    }

    #[test]
    fn debit_bounded_by_balance_including_same_set_credits() {
        let mut store = MemoryStore::new();
        let mut ws = WriteSet::new();
        ws.append(entry(1, 3, Direction::Credit, 440, 1));
        store.commit(ws).unwrap();

        let mut over = WriteSet::new();
        over.append(entry(1, 3, Direction::Debit, 880, 2));
        assert_eq!(
            store.commit(over).unwrap_err(),
            StoreError::Conflict(Conflict::Overdraft {
                member: MemberId(1),
                track: TRACK,
                tier: 3,
                have: 440,
                need: 880,
            })
        );

        let mut ok = WriteSet::new();
        ok.append(entry(1, 3, Direction::Credit, 440, 3))
            .append(entry(1, 3, Direction::Debit, 880, 4));
        store.commit(ok).unwrap();
        assert_eq!(store.entry_count(), 3);
        assert_eq!(net_units(&store.holding_entries(&TierKey::new(MemberId(1), TRACK, 3)).unwrap()), 0);
    }

    #[test]
    fn unresolved_raise_and_resolve() {
        let mut store = MemoryStore::new();
        let mut ws = WriteSet::new();
        ws.raise(event(10)).raise(event(11));
        store.commit(ws).unwrap();
        assert_eq!(store.unresolved_events().unwrap().len(), 2);
        assert_eq!(store.unresolved_event(11).unwrap().unwrap().id, 11);

        let mut ws = WriteSet::new();
        ws.resolve(10);
        store.commit(ws).unwrap();
        let left: Vec<u64> = store.unresolved_events().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(left, vec![11]);

        let mut ws = WriteSet::new();
        ws.resolve(10);
        assert_eq!(
            store.commit(ws).unwrap_err(),
            StoreError::Conflict(Conflict::UnknownEvent(10))
        );
    }

    #[test]
    fn seq_strictly_increases() {
        let store = MemoryStore::new();
        let a = store.next_seq().unwrap();
        let b = store.next_seq().unwrap();
        assert!(b > a);
        assert!(a >= 1);
    }

    #[test]
    fn activations_for_sorted_by_tier() {
        let mut store = MemoryStore::new();
        let mut ws = WriteSet::new();
        ws.activate(activation(1, 3))
            .activate(activation(1, 1))
            .activate(activation(2, 2));
        store.commit(ws).unwrap();
        let tiers: Vec<u32> = store
            .activations_for(MemberId(1), TRACK)
            .unwrap()
            .iter()
            .map(|a| a.tier_no)
            .collect();
        assert_eq!(tiers, vec![1, 3]);
    }

    #[test]
    fn empty_write_set() {
        let mut store = MemoryStore::new();
        assert!(WriteSet::new().is_empty());
        assert_eq!(store.commit(WriteSet::new()).unwrap(), CommitSummary::default());
    }
}
