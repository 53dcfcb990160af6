use super::{ConsistencyError, TickEntry, TickStateStore};
use crate::event::LiquidityEvent;
use crate::types::{TickIndex, MAX_TICK, MIN_TICK};

/// 对单个头寸区间的一次流动性变更。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityUpdate {
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity_delta: i128,
    pub block_number: u64,
}

impl From<&LiquidityEvent> for LiquidityUpdate {
    fn from(event: &LiquidityEvent) -> Self {
        Self {
            tick_lower: event.tick_lower,
            tick_upper: event.tick_upper,
            liquidity_delta: event.liquidity_delta,
            block_number: event.block_number,
        }
    }
}

/// 计算完成、尚未写入的单个 tick 变更。
struct TickChange {
    tick: TickIndex,
    gross_before: u128,
    after: TickEntry,
}

/// 将一次流动性变更应用到 tick 状态上。
///
/// 与链上 `Tick.update` 一致：两端 tick 的 gross 都按带符号 delta 累加，
/// 下界 net 加 delta、上界 net 减 delta；gross 从 0 变正时置位，
/// 回到 0 时清位并删除条目。任何错误都发生在写入之前，失败时状态不变。
pub fn apply_liquidity_update(
    store: &mut TickStateStore,
    update: &LiquidityUpdate,
) -> Result<(), ConsistencyError> {
    validate(store.tick_spacing(), update)?;

    let lower = plan(store, TickIndex(update.tick_lower), update, false)?;
    let upper = plan(store, TickIndex(update.tick_upper), update, true)?;

    commit(store, lower);
    commit(store, upper);
    Ok(())
}

fn validate(tick_spacing: i32, update: &LiquidityUpdate) -> Result<(), ConsistencyError> {
    if tick_spacing <= 0 {
        return Err(ConsistencyError::InvalidTickSpacing(tick_spacing));
    }
    for tick in [update.tick_lower, update.tick_upper] {
        if !TickIndex(tick).is_aligned(tick_spacing) {
            return Err(ConsistencyError::InvalidTickAlignment { tick, tick_spacing });
        }
    }
    if update.tick_lower >= update.tick_upper
        || update.tick_lower < MIN_TICK
        || update.tick_upper > MAX_TICK
    {
        return Err(ConsistencyError::InvalidTickRange {
            tick_lower: update.tick_lower,
            tick_upper: update.tick_upper,
        });
    }
    Ok(())
}

fn plan(
    store: &TickStateStore,
    tick: TickIndex,
    update: &LiquidityUpdate,
    is_upper: bool,
) -> Result<TickChange, ConsistencyError> {
    let delta = update.liquidity_delta;
    let before = store.tick(tick).copied().unwrap_or_default();

    let gross_after = if delta >= 0 {
        before
            .liquidity_gross
            .checked_add(delta.unsigned_abs())
            .ok_or(ConsistencyError::GrossOverflow {
                tick: tick.0,
                gross_before: before.liquidity_gross,
                delta,
            })?
    } else {
        before
            .liquidity_gross
            .checked_sub(delta.unsigned_abs())
            .ok_or(ConsistencyError::GrossUnderflow {
                tick: tick.0,
                gross_before: before.liquidity_gross,
                delta,
            })?
    };

    let net_after = if is_upper {
        before.liquidity_net.checked_sub(delta)
    } else {
        before.liquidity_net.checked_add(delta)
    }
    .ok_or(ConsistencyError::NetOverflow {
        tick: tick.0,
        net_before: before.liquidity_net,
        delta,
    })?;

    if gross_after == 0 && net_after != 0 {
        return Err(ConsistencyError::NetWithoutGross {
            tick: tick.0,
            net: net_after,
        });
    }

    Ok(TickChange {
        tick,
        gross_before: before.liquidity_gross,
        after: TickEntry {
            liquidity_net: net_after,
            liquidity_gross: gross_after,
            last_touched_block: update.block_number,
        },
    })
}

fn commit(store: &mut TickStateStore, change: TickChange) {
    let gross_after = change.after.liquidity_gross;
    if gross_after == 0 {
        store.ticks_mut().remove(&change.tick);
    } else {
        store.ticks_mut().insert(change.tick, change.after);
    }

    if change.gross_before == 0 && gross_after > 0 {
        store.flip_bit(change.tick, true);
    } else if change.gross_before > 0 && gross_after == 0 {
        store.flip_bit(change.tick, false);
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::U256;

    use super::*;
    use crate::types::WordIndex;

    fn update(lower: i32, upper: i32, delta: i128, block: u64) -> LiquidityUpdate {
        LiquidityUpdate {
            tick_lower: lower,
            tick_upper: upper,
            liquidity_delta: delta,
            block_number: block,
        }
    }

    fn net_gross(store: &TickStateStore, tick: i32) -> Option<(i128, u128)> {
        store
            .tick(TickIndex(tick))
            .map(|entry| (entry.liquidity_net, entry.liquidity_gross))
    }

    #[test]
    fn test_mint_then_burn_clears_ticks_and_bits() {
        let mut store = TickStateStore::new(60);
        apply_liquidity_update(&mut store, &update(-600, 600, 1_000, 1)).unwrap();
        assert_eq!(net_gross(&store, -600), Some((1_000, 1_000)));
        assert_eq!(net_gross(&store, 600), Some((-1_000, 1_000)));
        assert!(store.is_initialized(TickIndex(-600)));
        assert!(store.is_initialized(TickIndex(600)));
        assert_eq!(store.bitmap().len(), 2);

        apply_liquidity_update(&mut store, &update(-600, 600, -1_000, 2)).unwrap();
        assert_eq!(net_gross(&store, -600), None);
        assert_eq!(net_gross(&store, 600), None);
        assert!(!store.is_initialized(TickIndex(-600)));
        assert!(!store.is_initialized(TickIndex(600)));
        assert!(store.is_empty());
        assert!(store.bitmap().is_empty());
    }

    #[test]
    fn test_adjacent_positions_share_middle_tick() {
        let mut store = TickStateStore::new(60);
        apply_liquidity_update(&mut store, &update(0, 60, 500, 1)).unwrap();
        apply_liquidity_update(&mut store, &update(60, 120, 300, 2)).unwrap();

        assert_eq!(net_gross(&store, 0), Some((500, 500)));
        assert_eq!(net_gross(&store, 60), Some((-200, 800)));
        assert_eq!(net_gross(&store, 120), Some((-300, 300)));
        assert_eq!(store.word(WordIndex(0)), U256::from(0b111u64));
        assert_eq!(store.tick(TickIndex(60)).unwrap().last_touched_block, 2);
        assert_eq!(store.tick(TickIndex(0)).unwrap().last_touched_block, 1);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_misaligned_tick_is_rejected_without_mutation() {
        let mut store = TickStateStore::new(60);
        apply_liquidity_update(&mut store, &update(0, 60, 500, 1)).unwrap();
        let before = store.clone();

        let err = apply_liquidity_update(&mut store, &update(30, 120, 100, 2)).unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::InvalidTickAlignment {
                tick: 30,
                tick_spacing: 60
            }
        );
        assert_eq!(store, before);
    }

    #[test]
    fn test_inverted_or_out_of_range_ticks_are_rejected() {
        let mut store = TickStateStore::new(1);
        assert!(matches!(
            apply_liquidity_update(&mut store, &update(10, 10, 1, 1)),
            Err(ConsistencyError::InvalidTickRange { .. })
        ));
        assert!(matches!(
            apply_liquidity_update(&mut store, &update(-887_273, 0, 1, 1)),
            Err(ConsistencyError::InvalidTickRange { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_gross_underflow_is_fatal_and_atomic() {
        let mut store = TickStateStore::new(10);
        apply_liquidity_update(&mut store, &update(-20, 20, 100, 1)).unwrap();
        apply_liquidity_update(&mut store, &update(20, 40, 5, 2)).unwrap();
        let before = store.clone();

        // 下界 tick 20 足够扣减，上界 tick 40 不够：整次更新都不能落地
        let err = apply_liquidity_update(&mut store, &update(20, 40, -50, 3)).unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::GrossUnderflow {
                tick: 40,
                gross_before: 5,
                delta: -50
            }
        );
        assert_eq!(store, before);
    }

    #[test]
    fn test_burn_on_absent_tick_underflows() {
        let mut store = TickStateStore::new(60);
        let err = apply_liquidity_update(&mut store, &update(-60, 60, -1, 7)).unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::GrossUnderflow {
                tick: -60,
                gross_before: 0,
                delta: -1
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_delta_only_touches_existing_ticks() {
        let mut store = TickStateStore::new(60);
        apply_liquidity_update(&mut store, &update(-60, 60, 10, 1)).unwrap();
        apply_liquidity_update(&mut store, &update(-60, 120, 0, 9)).unwrap();

        assert_eq!(store.tick(TickIndex(-60)).unwrap().last_touched_block, 9);
        assert_eq!(net_gross(&store, -60), Some((10, 10)));
        assert_eq!(net_gross(&store, 120), None);
        assert!(!store.is_initialized(TickIndex(120)));
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_bits_land_in_separate_words() {
        let mut store = TickStateStore::new(1);
        apply_liquidity_update(&mut store, &update(-1, 256, 42, 1)).unwrap();

        assert_eq!(store.word(WordIndex(-1)), U256::one() << 255);
        assert_eq!(store.word(WordIndex(1)), U256::one());
        assert_eq!(store.bitmap().len(), 2);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_partial_burn_keeps_bit_set() {
        let mut store = TickStateStore::new(60);
        apply_liquidity_update(&mut store, &update(-120, 120, 1_000, 1)).unwrap();
        apply_liquidity_update(&mut store, &update(-120, 120, -400, 2)).unwrap();
        assert_eq!(net_gross(&store, -120), Some((600, 600)));
        assert_eq!(net_gross(&store, 120), Some((-600, 600)));
        assert!(store.is_initialized(TickIndex(-120)));
    }
}
