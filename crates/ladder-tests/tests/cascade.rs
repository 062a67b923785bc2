//! End-to-end cascade scenarios over the in-memory store.

use ladder_core::error::PlacementError;
use ladder_core::types::{
    ActivationSource, Amount, Direction, FeeRoute, MemberId, PayoutReason, RouteReason, Side, TierKey,
    UnresolvedKind,
};
use ladder_engine::{CascadeError, EngineConfig, StepOutcome};
use ladder_tests::helpers::*;

fn key(member: u64, tier: u32) -> TierKey {
    TierKey::new(MemberId(member), TRACK, tier)
}

#[test]
fn two_tier2_fees_unlock_ancestor_tier3() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(e, &[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2)), (5, Some(2))]);
    e.request_unlock(MemberId(1), TRACK, 2, fee("0.0044")).unwrap();
    e.request_unlock(MemberId(2), TRACK, 2, fee("0.0044")).unwrap();

    let first = e.request_unlock(MemberId(4), TRACK, 2, fee("0.0044")).unwrap();
    assert_eq!(first.activation_count(), 1);
    assert_eq!(e.balance(MemberId(1), TRACK, 3).unwrap(), fee("0.0044"));
    assert_eq!(e.activation(MemberId(1), TRACK, 3).unwrap(), None);

    let second = e.request_unlock(MemberId(5), TRACK, 2, fee("0.0044")).unwrap();
    let activated: Vec<TierKey> = second.activated().copied().collect();
    assert_eq!(activated, vec![key(5, 2), key(1, 3)]);
    assert!(second.is_clean());

    let unlocked = e.activation(MemberId(1), TRACK, 3).unwrap().unwrap();
    assert_eq!(unlocked.fee_paid, fee("0.0088"));
    assert_eq!(unlocked.source, ActivationSource::HoldingFunds);
    assert!(unlocked.is_auto_triggered);
    assert_eq!(e.balance(MemberId(1), TRACK, 3).unwrap(), Amount::ZERO);

    // 1 is the tier-3 root, so its own tier-3 fee has nowhere to climb.
    let forwards = h.pool.forwards.lock();
    let last = forwards.last().unwrap();
    assert_eq!((last.member, last.tier, last.amount), (MemberId(1), 3, fee("0.0088")));
    assert_eq!(last.reason, RouteReason::NoAncestor);
}

#[test]
fn cascade_climbs_three_tiers_in_one_request() {
    let h = memory_harness(flat_catalog(4, fee("0.0044")));
    let e = &h.engine;
    // A referral chain: each member referred by the previous one.
    register_all(e, &[(1, None), (2, Some(1)), (3, Some(2)), (4, Some(3)), (5, Some(4)), (6, Some(5))]);
    for m in [1, 2, 3] {
        e.request_unlock(MemberId(m), TRACK, 3, fee("0.0044")).unwrap();
    }
    for m in [4, 5] {
        e.request_unlock(MemberId(m), TRACK, 2, fee("0.0044")).unwrap();
    }
    let pooled_before = h.pool.forwards.lock().len();

    let report = e.request_unlock(MemberId(6), TRACK, 2, fee("0.0044")).unwrap();

    let routes: Vec<(TierKey, FeeRoute)> = report
        .steps
        .iter()
        .filter_map(|s| match s {
            StepOutcome::Activated { key, route, .. } => Some((*key, *route)),
            _ => None,
        })
        .collect();
    assert_eq!(
        routes,
        vec![
            (key(6, 2), FeeRoute::Holding { ancestor: MemberId(4), funds_tier: 3 }),
            (key(4, 3), FeeRoute::Holding { ancestor: MemberId(1), funds_tier: 4 }),
            (key(1, 4), FeeRoute::Pool { reason: RouteReason::NoAncestor }),
        ]
    );

    // 4 joined the tier-3 tree under 3, three levels below 1.
    let four = e.placement(MemberId(4), TRACK, 3).unwrap().unwrap();
    assert_eq!((four.tree_parent_id, four.depth), (Some(MemberId(3)), 3));
    assert_eq!(e.upline(MemberId(4), TRACK, 3).unwrap().map(|p| p.member_id), Some(MemberId(1)));

    assert_eq!(h.pool.forwards.lock().len(), pooled_before + 1);
    assert_eq!(e.balance(MemberId(4), TRACK, 3).unwrap(), Amount::ZERO);
    assert_eq!(e.balance(MemberId(1), TRACK, 4).unwrap(), Amount::ZERO);
}

#[test]
fn third_placement_at_depth_is_pooled() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(
        e,
        &[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2)), (5, Some(2)), (6, Some(3))],
    );
    for m in [1, 2, 3, 4, 5] {
        e.request_unlock(MemberId(m), TRACK, 2, fee("0.0044")).unwrap();
    }
    let history_before = e.ledger_history(MemberId(1), TRACK, 3).unwrap();

    let report = e.request_unlock(MemberId(6), TRACK, 2, fee("0.0044")).unwrap();
    assert!(matches!(
        report.outcome_for(&key(6, 2)),
        Some(StepOutcome::Activated { route: FeeRoute::Pool { reason: RouteReason::NotEligible }, .. })
    ));
    assert_eq!(e.ledger_history(MemberId(1), TRACK, 3).unwrap(), history_before);

    let level: Vec<MemberId> = e
        .subtree_level(MemberId(1), TRACK, 2, 2)
        .unwrap()
        .iter()
        .map(|p| p.member_id)
        .collect();
    assert_eq!(level, vec![MemberId(4), MemberId(5), MemberId(6)]);
}

#[test]
fn overflow_placement_still_pays_the_referrer() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(e, &[(1, None), (2, Some(1)), (3, Some(1))]);
    let four = e.register(MemberId(4), Some(MemberId(1)), TRACK).unwrap();
    assert_eq!(four.tree_parent_id, Some(MemberId(2)));
    assert_eq!(four.side, Some(Side::Left));
    assert!(four.is_overflow());

    e.request_unlock(MemberId(4), TRACK, 1, fee("0.0022")).unwrap();
    assert_eq!(
        h.rail.payouts.lock().as_slice(),
        &[(MemberId(1), fee("0.0022"), PayoutReason::Referral)]
    );
}

#[test]
fn member_near_root_pools_for_missing_ancestor() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(e, &[(1, None), (2, Some(1)), (3, Some(2))]);
    for m in [1, 2, 3] {
        e.request_unlock(MemberId(m), TRACK, 3, fee("0.0088")).unwrap();
    }
    // 3 sits two levels deep; tier 3 needs three.
    assert_eq!(e.upline(MemberId(3), TRACK, 3).unwrap(), None);
    let forwards = h.pool.forwards.lock();
    assert_eq!(forwards.len(), 3);
    assert!(forwards.iter().all(|f| f.reason == RouteReason::NoAncestor));
}

#[test]
fn repeated_request_is_a_no_op() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(e, &[(1, None)]);
    e.request_unlock(MemberId(1), TRACK, 2, fee("0.0044")).unwrap();

    let again = e.request_unlock(MemberId(1), TRACK, 2, fee("0.0044")).unwrap();
    assert_eq!(again.steps, vec![StepOutcome::AlreadyActivated { key: key(1, 2) }]);
    assert_eq!(h.pool.forwards.lock().len(), 1);
}

#[test]
fn unregistered_member_cannot_unlock() {
    let h = memory_harness(doubling_catalog());
    let err = h.engine.request_unlock(MemberId(9), TRACK, 2, fee("0.0044")).unwrap_err();
    assert_eq!(
        err,
        CascadeError::Placement(PlacementError::NotRegistered { member: MemberId(9), track: TRACK })
    );
    assert!(h.engine.reconcile().unwrap().is_empty());
}

#[test]
fn pool_outage_is_journaled_and_replayed() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(e, &[(1, None)]);
    h.pool.set_down(true);

    let report = e.request_unlock(MemberId(1), TRACK, 2, fee("0.0044")).unwrap();
    assert!(!report.is_clean());
    assert!(e.activation(MemberId(1), TRACK, 2).unwrap().is_some());

    let pending = e.reconcile().unwrap();
    assert_eq!(pending.len(), 1);
    let event = &pending[0];
    assert_eq!(event.kind, UnresolvedKind::PoolForward { reason: RouteReason::NoAncestor });
    assert_eq!(event.amount, fee("0.0044"));

    // Still down: the event stays open.
    assert!(e.retry_unresolved(event.id).is_err());
    assert_eq!(e.reconcile().unwrap().len(), 1);

    h.pool.set_down(false);
    let replay = e.retry_unresolved(event.id).unwrap();
    assert_eq!(replay.resolved, vec![event.id]);
    assert!(e.reconcile().unwrap().is_empty());

    let forwards = h.pool.forwards.lock();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].reference, event.reference);
}

#[test]
fn holding_ledger_records_origins() {
    let h = memory_harness(doubling_catalog());
    let e = &h.engine;
    register_all(e, &[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2)), (5, Some(3))]);
    for m in [1, 2, 3, 4, 5] {
        e.request_unlock(MemberId(m), TRACK, 2, fee("0.0044")).unwrap();
    }

    let history = e.ledger_history(MemberId(1), TRACK, 3).unwrap();
    let summary: Vec<(Direction, MemberId)> =
        history.iter().map(|l| (l.direction, l.origin_member_id)).collect();
    assert_eq!(
        summary,
        vec![
            (Direction::Credit, MemberId(4)),
            (Direction::Credit, MemberId(5)),
            (Direction::Debit, MemberId(1)),
        ]
    );
    assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn configured_fallback_receives_rootless_fees() {
    let config = EngineConfig::from_toml_str(
        r#"
        fallback_account = 100
        no_ancestor_route = "fallback-account"

        [retry]
        max_attempts = 2
        base_backoff_ms = 0
        max_backoff_ms = 0

        [[tracks]]
        track = 1
        prices = ["0.0022", "0.0044", "0.0088"]
        "#,
    )
    .unwrap();
    let catalog = config.catalog().unwrap();
    let h = harness_with(ladder_core::store::MemoryStore::new(), catalog, config);
    let e = &h.engine;
    register_all(e, &[(1, None), (2, Some(1))]);

    e.request_unlock(MemberId(1), TRACK, 1, fee("0.0022")).unwrap();
    e.request_unlock(MemberId(2), TRACK, 2, fee("0.0044")).unwrap();

    assert_eq!(
        h.rail.payouts.lock().as_slice(),
        &[
            (MemberId(100), fee("0.0022"), PayoutReason::FallbackAccount),
            (MemberId(100), fee("0.0044"), PayoutReason::FallbackAccount),
        ]
    );
    assert!(h.pool.forwards.lock().is_empty());
}
