use std::collections::BTreeMap;

use liquidity_snapshot_core::state::{apply_liquidity_update, LiquidityUpdate, TickStateStore};
use liquidity_snapshot_core::types::TickIndex;
use proptest::prelude::*;

const SPACING: i32 = 60;

fn position_strategy() -> impl Strategy<Value = (i32, i32, i128)> {
    (-40i32..40, 1i32..12, 1i128..1_000_000_000_000i128).prop_map(|(lower, width, amount)| {
        (lower * SPACING, (lower + width) * SPACING, amount)
    })
}

fn update(lower: i32, upper: i32, delta: i128, block: u64) -> LiquidityUpdate {
    LiquidityUpdate {
        tick_lower: lower,
        tick_upper: upper,
        liquidity_delta: delta,
        block_number: block,
    }
}

fn net_gross(store: &TickStateStore) -> BTreeMap<TickIndex, (i128, u128)> {
    store
        .ticks()
        .iter()
        .map(|(tick, entry)| (*tick, (entry.liquidity_net, entry.liquidity_gross)))
        .collect()
}

fn apply_all(positions: &[(i32, i32, i128)]) -> TickStateStore {
    let mut store = TickStateStore::new(SPACING);
    for (block, (lower, upper, amount)) in positions.iter().enumerate() {
        apply_liquidity_update(&mut store, &update(*lower, *upper, *amount, block as u64)).unwrap();
    }
    store
}

proptest! {
    #[test]
    fn mint_order_does_not_change_net_and_gross(
        (positions, shuffled) in prop::collection::vec(position_strategy(), 1..40)
            .prop_flat_map(|positions| {
                let shuffled = Just(positions.clone()).prop_shuffle();
                (Just(positions), shuffled)
            })
    ) {
        let forward = apply_all(&positions);
        let permuted = apply_all(&shuffled);
        prop_assert_eq!(net_gross(&forward), net_gross(&permuted));
        prop_assert_eq!(forward.bitmap(), permuted.bitmap());
        prop_assert!(forward.check_invariants().is_ok());
    }

    #[test]
    fn burning_every_position_empties_the_store(
        (positions, burn_order) in prop::collection::vec(position_strategy(), 1..30)
            .prop_flat_map(|positions| {
                let order = Just((0..positions.len()).collect::<Vec<_>>()).prop_shuffle();
                (Just(positions), order)
            })
    ) {
        let mut store = apply_all(&positions);
        let mut block = positions.len() as u64;
        for index in burn_order {
            let (lower, upper, amount) = positions[index];
            apply_liquidity_update(&mut store, &update(lower, upper, -amount, block)).unwrap();
            block += 1;

            prop_assert!(store.check_invariants().is_ok());
            for (tick, entry) in store.ticks() {
                prop_assert!(entry.liquidity_gross > 0);
                prop_assert!(store.is_initialized(*tick));
            }
        }
        prop_assert!(store.is_empty());
        prop_assert!(store.bitmap().is_empty());
    }

    #[test]
    fn net_sums_to_zero_across_all_ticks(
        positions in prop::collection::vec(position_strategy(), 0..40)
    ) {
        let store = apply_all(&positions);
        let total: i128 = store.ticks().values().map(|entry| entry.liquidity_net).sum();
        prop_assert_eq!(total, 0);
    }
}
