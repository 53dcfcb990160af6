use std::collections::BTreeSet;
use std::sync::Arc;

use ethers::types::U256;
use serde::Serialize;

use crate::state::onchain::{LiveStateReader, LiveTick, ReaderError};
use crate::state::PoolSnapshot;
use crate::types::{PoolId, TickIndex, WordIndex, MAX_TICK, MIN_TICK};

/// 默认单批链上调用数量。
pub const DEFAULT_VALIDATION_BATCH_SIZE: usize = 200;

/// 校验范围。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationScope {
    /// 只核对快照中出现的 tick 以及它们所在的位图字。
    SnapshotTicks,
    /// 按 tick 间距遍历协议全区间的每个合法 tick 与每个位图字。
    Exhaustive,
}

/// 单条不一致记录，两边的值都保留以便排查。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationMismatch {
    Tick {
        tick: i32,
        #[serde(with = "crate::serde_utils::i128_string")]
        computed_net: i128,
        #[serde(with = "crate::serde_utils::u128_string")]
        computed_gross: u128,
        #[serde(with = "crate::serde_utils::i128_string")]
        onchain_net: i128,
        #[serde(with = "crate::serde_utils::u128_string")]
        onchain_gross: u128,
    },
    Word {
        word: i16,
        #[serde(with = "crate::serde_utils::u256_string")]
        computed: U256,
        #[serde(with = "crate::serde_utils::u256_string")]
        onchain: U256,
    },
}

/// 校验报告。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub pool_id: PoolId,
    pub block: u64,
    pub snapshot_block: u64,
    pub ticks_checked: usize,
    pub words_checked: usize,
    pub mismatches: Vec<ValidationMismatch>,
}

impl ValidationReport {
    pub fn checked(&self) -> usize {
        self.ticks_checked + self.words_checked
    }

    /// 匹配率，取值 0.0 到 1.0；没有任何检查项时视为全部匹配。
    pub fn match_rate(&self) -> f64 {
        let checked = self.checked();
        if checked == 0 {
            return 1.0;
        }
        (checked - self.mismatches.len()) as f64 / checked as f64
    }

    pub fn is_exact(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("链上读取失败: {0}")]
    Reader(#[from] ReaderError),
    #[error("池子 {0} 缺少快照")]
    MissingSnapshot(PoolId),
    #[error("链上返回缺少 {0}")]
    IncompleteResponse(String),
}

/// 链上状态校验器：在指定区块拉取真实 tick 与位图，与计算出的快照逐项比对。
///
/// 校验只读，不修改快照。
pub struct LiveStateValidator {
    reader: Arc<dyn LiveStateReader>,
    batch_size: usize,
}

impl LiveStateValidator {
    pub fn new(reader: Arc<dyn LiveStateReader>, batch_size: usize) -> Self {
        Self {
            reader,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn validate(
        &self,
        snapshot: &PoolSnapshot,
        block: u64,
        scope: ValidationScope,
    ) -> Result<ValidationReport, ValidationError> {
        if snapshot.snapshot_block != block {
            tracing::warn!(
                pool = %snapshot.pool_id,
                "快照区块 {} 与校验区块 {} 不一致，结果可能包含区间内的真实变化",
                snapshot.snapshot_block,
                block
            );
        }

        let spacing = snapshot.pool.tick_spacing;
        let (ticks, words): (Vec<TickIndex>, Vec<WordIndex>) = match scope {
            ValidationScope::SnapshotTicks => {
                let ticks: Vec<TickIndex> = snapshot.tick_data.keys().copied().collect();
                let words: BTreeSet<WordIndex> = ticks
                    .iter()
                    .map(|tick| tick.position(spacing).0)
                    .chain(snapshot.tick_bitmap.keys().copied())
                    .collect();
                (ticks, words.into_iter().collect())
            }
            ValidationScope::Exhaustive => {
                let first =
                    MIN_TICK.div_euclid(spacing) + i32::from(MIN_TICK.rem_euclid(spacing) != 0);
                let last = MAX_TICK.div_euclid(spacing);
                let ticks = (first..=last)
                    .map(|compressed| TickIndex(compressed * spacing))
                    .collect();
                let words = WordIndex::full_range(spacing).map(WordIndex).collect();
                (ticks, words)
            }
        };

        let mut report = ValidationReport {
            pool_id: snapshot.pool_id,
            block,
            snapshot_block: snapshot.snapshot_block,
            ticks_checked: 0,
            words_checked: 0,
            mismatches: Vec::new(),
        };

        for batch in ticks.chunks(self.batch_size) {
            let live = self.reader.fetch_ticks(&snapshot.pool, batch, block).await?;
            for tick in batch {
                let onchain: LiveTick = *live
                    .get(tick)
                    .ok_or_else(|| ValidationError::IncompleteResponse(format!("tick {}", tick)))?;
                let computed = snapshot.tick_data.get(tick).copied().unwrap_or_default();
                report.ticks_checked += 1;
                if computed.liquidity_net != onchain.liquidity_net
                    || computed.liquidity_gross != onchain.liquidity_gross
                {
                    report.mismatches.push(ValidationMismatch::Tick {
                        tick: tick.0,
                        computed_net: computed.liquidity_net,
                        computed_gross: computed.liquidity_gross,
                        onchain_net: onchain.liquidity_net,
                        onchain_gross: onchain.liquidity_gross,
                    });
                }
            }
        }

        for batch in words.chunks(self.batch_size) {
            let live = self.reader.fetch_bitmap(&snapshot.pool, batch, block).await?;
            for word in batch {
                let onchain = *live
                    .get(word)
                    .ok_or_else(|| {
                        ValidationError::IncompleteResponse(format!("word {}", word.0))
                    })?;
                let computed = snapshot.tick_bitmap.get(word).copied().unwrap_or_default();
                report.words_checked += 1;
                if computed != onchain {
                    report.mismatches.push(ValidationMismatch::Word {
                        word: word.0,
                        computed,
                        onchain,
                    });
                }
            }
        }

        tracing::info!(
            pool = %report.pool_id,
            block = report.block,
            "校验完成: tick {}, 位图字 {}, 不一致 {}, 匹配率 {:.4}%",
            report.ticks_checked,
            report.words_checked,
            report.mismatches.len(),
            report.match_rate() * 100.0
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use ethers::types::Address;

    use super::*;
    use crate::state::onchain::InMemoryLiveStateReader;
    use crate::state::{apply_liquidity_update, LiquidityUpdate, TickStateStore};
    use crate::types::{Pool, PoolKind};

    fn pool(tick_spacing: i32) -> Pool {
        Pool {
            id: PoolId::Address(Address::repeat_byte(0x33)),
            factory: Address::zero(),
            asset0: Address::repeat_byte(0x11),
            asset1: Address::repeat_byte(0x22),
            fee: 10_000,
            tick_spacing,
            protocol: PoolKind::V3,
        }
    }

    fn state_with(tick_spacing: i32, updates: &[(i32, i32, i128)]) -> TickStateStore {
        let mut state = TickStateStore::new(tick_spacing);
        for (block, (lower, upper, delta)) in updates.iter().enumerate() {
            apply_liquidity_update(
                &mut state,
                &LiquidityUpdate {
                    tick_lower: *lower,
                    tick_upper: *upper,
                    liquidity_delta: *delta,
                    block_number: block as u64,
                },
            )
            .unwrap();
        }
        state
    }

    #[tokio::test]
    async fn test_matching_state_reports_full_match() {
        let pool = pool(200);
        let state = state_with(200, &[(-887_200, 887_200, 10), (-400, 400, 99)]);
        let snapshot = PoolSnapshot::from_state(&pool, &state, 50, 50);
        let mut reader = InMemoryLiveStateReader::new();
        reader.insert(pool.id, state);

        let validator = LiveStateValidator::new(Arc::new(reader), 3);
        let report = validator
            .validate(&snapshot, 50, ValidationScope::SnapshotTicks)
            .await
            .unwrap();
        assert_eq!(report.ticks_checked, 4);
        assert!(report.is_exact());
        assert_eq!(report.match_rate(), 1.0);

        let report = validator
            .validate(&snapshot, 50, ValidationScope::Exhaustive)
            .await
            .unwrap();
        assert_eq!(report.ticks_checked, 8_873);
        assert!(report.is_exact());
    }

    #[tokio::test]
    async fn test_divergent_state_reports_tick_and_word() {
        let pool = pool(60);
        let computed = state_with(60, &[(-600, 600, 1_000)]);
        let onchain = state_with(60, &[(-600, 600, 1_000), (600, 1_200, 5)]);
        let snapshot = PoolSnapshot::from_state(&pool, &computed, 10, 10);
        let mut reader = InMemoryLiveStateReader::new();
        reader.insert(pool.id, onchain);

        let validator = LiveStateValidator::new(Arc::new(reader), 200);
        let report = validator
            .validate(&snapshot, 10, ValidationScope::SnapshotTicks)
            .await
            .unwrap();
        assert_eq!(
            report.mismatches,
            vec![ValidationMismatch::Tick {
                tick: 600,
                computed_net: -1_000,
                computed_gross: 1_000,
                onchain_net: -995,
                onchain_gross: 1_005,
            },
            ValidationMismatch::Word {
                word: 0,
                computed: U256::one() << 10,
                onchain: (U256::one() << 10) | (U256::one() << 20),
            }]
        );
        assert_eq!(report.checked(), 4);
        assert_eq!(report.match_rate(), 0.5);

        let report = validator
            .validate(&snapshot, 10, ValidationScope::Exhaustive)
            .await
            .unwrap();
        assert!(report
            .mismatches
            .iter()
            .any(|m| matches!(m, ValidationMismatch::Tick { tick: 1_200, .. })));
    }

    struct DroppingReader;

    #[async_trait]
    impl LiveStateReader for DroppingReader {
        async fn fetch_ticks(
            &self,
            _pool: &Pool,
            _ticks: &[TickIndex],
            _block: u64,
        ) -> Result<BTreeMap<TickIndex, LiveTick>, ReaderError> {
            Ok(BTreeMap::new())
        }

        async fn fetch_bitmap(
            &self,
            _pool: &Pool,
            _words: &[WordIndex],
            _block: u64,
        ) -> Result<BTreeMap<WordIndex, U256>, ReaderError> {
            Err(ReaderError::Rpc("超时".into()))
        }
    }

    #[tokio::test]
    async fn test_incomplete_reader_response_is_an_error() {
        let pool = pool(60);
        let state = state_with(60, &[(-60, 60, 1)]);
        let snapshot = PoolSnapshot::from_state(&pool, &state, 1, 1);
        let validator = LiveStateValidator::new(Arc::new(DroppingReader), 10);
        assert!(matches!(
            validator.validate(&snapshot, 1, ValidationScope::SnapshotTicks).await,
            Err(ValidationError::IncompleteResponse(_))
        ));
    }
}
