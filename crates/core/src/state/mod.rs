pub mod onchain;
pub mod snapshot;
pub mod update;

use std::collections::BTreeMap;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::types::{TickIndex, WordIndex};

pub use self::snapshot::PoolSnapshot;
pub use self::update::{apply_liquidity_update, LiquidityUpdate};

/// 单个已初始化 tick 的流动性信息。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEntry {
    #[serde(with = "crate::serde_utils::i128_string")]
    pub liquidity_net: i128,
    #[serde(with = "crate::serde_utils::u128_string")]
    pub liquidity_gross: u128,
    #[serde(rename = "block_number")]
    pub last_touched_block: u64,
}

/// 单个池子的稀疏 tick 状态：tick 映射 + 压缩位图。
///
/// 位图是 tick 映射的派生索引：某位为 1 当且仅当对应 tick 的
/// `liquidity_gross > 0`。两者只通过 [`apply_liquidity_update`] 一起修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickStateStore {
    tick_spacing: i32,
    ticks: BTreeMap<TickIndex, TickEntry>,
    bitmap: BTreeMap<WordIndex, U256>,
}

impl TickStateStore {
    pub fn new(tick_spacing: i32) -> Self {
        Self {
            tick_spacing,
            ticks: BTreeMap::new(),
            bitmap: BTreeMap::new(),
        }
    }

    /// 从持久化数据恢复，恢复前校验位图与 tick 映射是否一致。
    pub fn from_parts(
        tick_spacing: i32,
        ticks: BTreeMap<TickIndex, TickEntry>,
        bitmap: BTreeMap<WordIndex, U256>,
    ) -> Result<Self, ConsistencyError> {
        let store = Self {
            tick_spacing,
            ticks,
            bitmap,
        };
        store.check_invariants()?;
        Ok(store)
    }

    pub fn tick_spacing(&self) -> i32 {
        self.tick_spacing
    }

    pub fn ticks(&self) -> &BTreeMap<TickIndex, TickEntry> {
        &self.ticks
    }

    pub fn bitmap(&self) -> &BTreeMap<WordIndex, U256> {
        &self.bitmap
    }

    pub fn tick(&self, tick: TickIndex) -> Option<&TickEntry> {
        self.ticks.get(&tick)
    }

    pub fn word(&self, word: WordIndex) -> U256 {
        self.bitmap.get(&word).copied().unwrap_or_default()
    }

    pub fn is_initialized(&self, tick: TickIndex) -> bool {
        let (word, bit) = tick.position(self.tick_spacing);
        self.word(word).bit(bit as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub(crate) fn ticks_mut(&mut self) -> &mut BTreeMap<TickIndex, TickEntry> {
        &mut self.ticks
    }

    pub(crate) fn flip_bit(&mut self, tick: TickIndex, initialized: bool) {
        let (word, bit) = tick.position(self.tick_spacing);
        let mask = U256::one() << bit as usize;
        let current = self.word(word);
        let next = if initialized {
            current | mask
        } else {
            current & !mask
        };
        if next.is_zero() {
            self.bitmap.remove(&word);
        } else {
            self.bitmap.insert(word, next);
        }
    }

    /// 校验全部不变量：tick 对齐、gross 非零、位图双向一致。
    pub fn check_invariants(&self) -> Result<(), ConsistencyError> {
        if self.tick_spacing <= 0 {
            return Err(ConsistencyError::InvalidTickSpacing(self.tick_spacing));
        }
        let mut expected: BTreeMap<WordIndex, U256> = BTreeMap::new();
        for (tick, entry) in &self.ticks {
            if !tick.is_aligned(self.tick_spacing) {
                return Err(ConsistencyError::InvalidTickAlignment {
                    tick: tick.0,
                    tick_spacing: self.tick_spacing,
                });
            }
            let (word, bit) = tick.position(self.tick_spacing);
            if entry.liquidity_gross == 0 {
                return Err(ConsistencyError::BitmapMismatch {
                    word: word.0,
                    reason: format!("tick {} 的 gross 为 0 却仍在映射中", tick),
                });
            }
            let slot = expected.entry(word).or_default();
            *slot = *slot | (U256::one() << bit as usize);
        }
        if expected != self.bitmap {
            let word = expected
                .keys()
                .chain(self.bitmap.keys())
                .find(|w| expected.get(*w) != self.bitmap.get(*w))
                .copied()
                .unwrap_or(WordIndex(0));
            return Err(ConsistencyError::BitmapMismatch {
                word: word.0,
                reason: format!(
                    "期望掩码 {}，实际掩码 {}",
                    expected.get(&word).copied().unwrap_or_default(),
                    self.bitmap.get(&word).copied().unwrap_or_default()
                ),
            });
        }
        Ok(())
    }
}

/// 一致性错误：对当前池子当前区块段是致命的，需要 force_rebuild 才能恢复。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("liquidity_gross 下溢: tick={tick}, gross={gross_before}, delta={delta}")]
    GrossUnderflow {
        tick: i32,
        gross_before: u128,
        delta: i128,
    },
    #[error("liquidity_gross 溢出: tick={tick}, gross={gross_before}, delta={delta}")]
    GrossOverflow {
        tick: i32,
        gross_before: u128,
        delta: i128,
    },
    #[error("liquidity_net 溢出: tick={tick}, net={net_before}, delta={delta}")]
    NetOverflow {
        tick: i32,
        net_before: i128,
        delta: i128,
    },
    #[error("gross 归零但 net 非零: tick={tick}, net={net}")]
    NetWithoutGross { tick: i32, net: i128 },
    #[error("tick 未按间距对齐: tick={tick}, tick_spacing={tick_spacing}")]
    InvalidTickAlignment { tick: i32, tick_spacing: i32 },
    #[error("tick 区间无效: lower={tick_lower}, upper={tick_upper}")]
    InvalidTickRange { tick_lower: i32, tick_upper: i32 },
    #[error("tick 间距无效: {0}")]
    InvalidTickSpacing(i32),
    #[error("位图与 tick 映射不一致: word={word}, {reason}")]
    BitmapMismatch { word: i16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_rejects_stale_bitmap() {
        let mut ticks = BTreeMap::new();
        ticks.insert(
            TickIndex(60),
            TickEntry {
                liquidity_net: 5,
                liquidity_gross: 5,
                last_touched_block: 1,
            },
        );
        let mut bitmap = BTreeMap::new();
        bitmap.insert(WordIndex(0), U256::from(0b11u64));

        let err = TickStateStore::from_parts(60, ticks.clone(), bitmap).unwrap_err();
        assert!(matches!(err, ConsistencyError::BitmapMismatch { word: 0, .. }));

        let mut bitmap = BTreeMap::new();
        bitmap.insert(WordIndex(0), U256::from(0b10u64));
        let store = TickStateStore::from_parts(60, ticks, bitmap).unwrap();
        assert!(store.is_initialized(TickIndex(60)));
        assert!(!store.is_initialized(TickIndex(0)));
    }

    #[test]
    fn test_from_parts_rejects_misaligned_tick() {
        let mut ticks = BTreeMap::new();
        ticks.insert(
            TickIndex(61),
            TickEntry {
                liquidity_net: 1,
                liquidity_gross: 1,
                last_touched_block: 1,
            },
        );
        let err = TickStateStore::from_parts(60, ticks, BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::InvalidTickAlignment {
                tick: 61,
                tick_spacing: 60
            }
        );
    }
}
