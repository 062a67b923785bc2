//! Randomized workloads: tree shape, credit limits, and fee conservation.

use std::collections::HashSet;

use proptest::prelude::*;

use ladder_core::store::CascadeStore;
use ladder_core::traits::TierCatalog;
use ladder_core::types::{Direction, MemberId, TierKey, TreeKey};
use ladder_engine::StepOutcome;
use ladder_tests::helpers::*;

const MAX_TIER: u32 = 4;

/// Referrer choices: member `i + 2` is referred by `1 + pick % (i + 1)`.
fn forest(picks: &[usize]) -> Vec<(u64, Option<u64>)> {
    let mut members = vec![(1, None)];
    for (i, pick) in picks.iter().enumerate() {
        let member = i as u64 + 2;
        members.push((member, Some(1 + (*pick as u64) % (member - 1))));
    }
    members
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn trees_stay_binary_and_connected(picks in prop::collection::vec(0usize..64, 1..40)) {
        let h = memory_harness(doubling_catalog());
        let members = forest(&picks);
        register_all(&h.engine, &members);

        let store = h.engine.store();
        let store = store.read();
        let placed = store.placements_in_tree(&TreeKey { track: TRACK, tier: 1 }).unwrap();
        prop_assert_eq!(placed.len(), members.len());

        let mut slots = HashSet::new();
        let mut roots = 0;
        for p in &placed {
            match p.tree_parent_id {
                None => roots += 1,
                Some(parent) => {
                    let parent_row = store.placement(&TierKey::new(parent, TRACK, 1)).unwrap();
                    prop_assert!(parent_row.is_some());
                    let parent_placement = parent_row.unwrap();
                    prop_assert_eq!(p.depth, parent_placement.depth + 1);
                    prop_assert!(slots.insert((parent, p.side)));
                    prop_assert!(parent_placement.filled <= 2);
                }
            }
        }
        prop_assert_eq!(roots, 1);
    }

    #[test]
    fn fees_are_conserved_and_credits_capped(
        picks in prop::collection::vec(0usize..64, 1..24),
        requests in prop::collection::vec((0usize..64, 1u32..=MAX_TIER), 1..60),
    ) {
        let catalog = doubling_catalog();
        let h = memory_harness(doubling_catalog());
        let members = forest(&picks);
        register_all(&h.engine, &members);

        let mut paid_in = 0u64;
        for (pick, tier) in requests {
            let member = MemberId(members[pick % members.len()].0);
            let price = catalog.price(TRACK, tier).unwrap().unwrap();
            let report = h.engine.request_unlock(member, TRACK, tier, price).unwrap();
            prop_assert!(report.is_clean());
            if matches!(report.steps.first(), Some(StepOutcome::Activated { .. })) {
                paid_in += price.units();
            }
            for step in &report.steps {
                if let StepOutcome::Activated { fee, auto: true, key, .. } = step {
                    prop_assert_eq!(Some(*fee), catalog.price(TRACK, key.tier).unwrap());
                }
            }
        }

        let ids: Vec<u64> = members.iter().map(|(m, _)| *m).collect();
        let held = total_held(&h.engine, &ids, MAX_TIER);
        prop_assert_eq!(h.pool.total() + h.rail.total() + held, paid_in);

        for &m in &ids {
            for tier in 1..=MAX_TIER {
                let credits = h
                    .engine
                    .ledger_history(MemberId(m), TRACK, tier)
                    .unwrap()
                    .iter()
                    .filter(|l| l.direction == Direction::Credit)
                    .count();
                prop_assert!(credits <= 2, "{} tier {} credited {} times", m, tier, credits);
            }
        }
    }
}
