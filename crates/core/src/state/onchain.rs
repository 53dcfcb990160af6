use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::{Address, U256};
use futures_util::future::try_join_all;
use thiserror::Error;

use super::TickStateStore;
use crate::types::{Pool, PoolId, PoolKind, TickIndex, WordIndex};

abigen!(
    UniswapV3PoolContract,
    r#"[
        function ticks(int24 tick) view returns (uint128 liquidityGross, int128 liquidityNet, uint256 feeGrowthOutside0X128, uint256 feeGrowthOutside1X128, int56 tickCumulativeOutside, uint160 secondsPerLiquidityOutsideX128, uint32 secondsOutside, bool initialized)
        function tickBitmap(int16 wordPosition) view returns (uint256)
    ]"#
);

abigen!(
    UniswapV4StateView,
    r#"[
        function getTickLiquidity(bytes32 poolId, int24 tick) view returns (uint128 liquidityGross, int128 liquidityNet)
        function getTickBitmap(bytes32 poolId, int16 wordPosition) view returns (uint256)
    ]"#
);

/// 链上读取到的单个 tick 流动性。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveTick {
    pub liquidity_net: i128,
    pub liquidity_gross: u128,
}

/// 在指定区块读取池子 tick 与位图的链上状态，供校验器对账使用。
///
/// 每次调用只读取一批，批内请求可以并发发出。
#[async_trait]
pub trait LiveStateReader: Send + Sync {
    async fn fetch_ticks(
        &self,
        pool: &Pool,
        ticks: &[TickIndex],
        block: u64,
    ) -> Result<BTreeMap<TickIndex, LiveTick>, ReaderError>;

    async fn fetch_bitmap(
        &self,
        pool: &Pool,
        words: &[WordIndex],
        block: u64,
    ) -> Result<BTreeMap<WordIndex, U256>, ReaderError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error("RPC 调用失败: {0}")]
    Rpc(String),
    #[error("未配置 V4 StateView 合约地址")]
    MissingStateView,
    #[error("池子 {pool} 无法按 {kind} 读取")]
    UnsupportedPool { pool: PoolId, kind: PoolKind },
}

/// 基于 ethers 合约调用的链上读取器。
#[derive(Debug, Clone)]
pub struct EthersLiveStateReader<M: Middleware> {
    provider: Arc<M>,
    state_view: Option<Address>,
}

impl<M: Middleware> EthersLiveStateReader<M> {
    pub fn new(provider: Arc<M>, state_view: Option<Address>) -> Self {
        Self {
            provider,
            state_view,
        }
    }

    fn v3_pool(&self, pool: &Pool) -> Result<UniswapV3PoolContract<M>, ReaderError> {
        match pool.id {
            PoolId::Address(address) => {
                Ok(UniswapV3PoolContract::new(address, self.provider.clone()))
            }
            PoolId::Id(_) => Err(ReaderError::UnsupportedPool {
                pool: pool.id,
                kind: PoolKind::V3,
            }),
        }
    }

    fn v4_view(&self, pool: &Pool) -> Result<(UniswapV4StateView<M>, [u8; 32]), ReaderError> {
        let address = self.state_view.ok_or(ReaderError::MissingStateView)?;
        match pool.id {
            PoolId::Id(id) => Ok((
                UniswapV4StateView::new(address, self.provider.clone()),
                id.to_fixed_bytes(),
            )),
            PoolId::Address(_) => Err(ReaderError::UnsupportedPool {
                pool: pool.id,
                kind: PoolKind::V4,
            }),
        }
    }
}

fn rpc_error(err: impl std::fmt::Display) -> ReaderError {
    ReaderError::Rpc(err.to_string())
}

#[async_trait]
impl<M> LiveStateReader for EthersLiveStateReader<M>
where
    M: Middleware + 'static,
{
    async fn fetch_ticks(
        &self,
        pool: &Pool,
        ticks: &[TickIndex],
        block: u64,
    ) -> Result<BTreeMap<TickIndex, LiveTick>, ReaderError> {
        let rows = match pool.protocol {
            PoolKind::V3 => {
                let contract = self.v3_pool(pool)?;
                let contract = &contract;
                try_join_all(ticks.iter().map(|tick| async move {
                    let info = contract
                        .ticks(tick.0)
                        .block(block)
                        .call()
                        .await
                        .map_err(rpc_error)?;
                    Ok::<_, ReaderError>((
                        *tick,
                        LiveTick {
                            liquidity_gross: info.0,
                            liquidity_net: info.1,
                        },
                    ))
                }))
                .await?
            }
            PoolKind::V4 => {
                let (view, pool_id) = self.v4_view(pool)?;
                let view = &view;
                try_join_all(ticks.iter().map(|tick| async move {
                    let (gross, net) = view
                        .get_tick_liquidity(pool_id, tick.0)
                        .block(block)
                        .call()
                        .await
                        .map_err(rpc_error)?;
                    Ok::<_, ReaderError>((
                        *tick,
                        LiveTick {
                            liquidity_gross: gross,
                            liquidity_net: net,
                        },
                    ))
                }))
                .await?
            }
        };
        Ok(rows.into_iter().collect())
    }

    async fn fetch_bitmap(
        &self,
        pool: &Pool,
        words: &[WordIndex],
        block: u64,
    ) -> Result<BTreeMap<WordIndex, U256>, ReaderError> {
        let rows = match pool.protocol {
            PoolKind::V3 => {
                let contract = self.v3_pool(pool)?;
                let contract = &contract;
                try_join_all(words.iter().map(|word| async move {
                    let mask = contract
                        .tick_bitmap(word.0)
                        .block(block)
                        .call()
                        .await
                        .map_err(rpc_error)?;
                    Ok::<_, ReaderError>((*word, mask))
                }))
                .await?
            }
            PoolKind::V4 => {
                let (view, pool_id) = self.v4_view(pool)?;
                let view = &view;
                try_join_all(words.iter().map(|word| async move {
                    let mask = view
                        .get_tick_bitmap(pool_id, word.0)
                        .block(block)
                        .call()
                        .await
                        .map_err(rpc_error)?;
                    Ok::<_, ReaderError>((*word, mask))
                }))
                .await?
            }
        };
        Ok(rows.into_iter().collect())
    }
}

/// 以内存中的 tick 状态充当“链上”状态的读取器，用于测试与离线对账。
#[derive(Debug, Default, Clone)]
pub struct InMemoryLiveStateReader {
    states: HashMap<PoolId, TickStateStore>,
}

impl InMemoryLiveStateReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pool: PoolId, state: TickStateStore) {
        self.states.insert(pool, state);
    }
}

#[async_trait]
impl LiveStateReader for InMemoryLiveStateReader {
    async fn fetch_ticks(
        &self,
        pool: &Pool,
        ticks: &[TickIndex],
        _block: u64,
    ) -> Result<BTreeMap<TickIndex, LiveTick>, ReaderError> {
        let state = self.states.get(&pool.id);
        Ok(ticks
            .iter()
            .map(|tick| {
                let live = state
                    .and_then(|state| state.tick(*tick))
                    .map(|entry| LiveTick {
                        liquidity_net: entry.liquidity_net,
                        liquidity_gross: entry.liquidity_gross,
                    })
                    .unwrap_or_default();
                (*tick, live)
            })
            .collect())
    }

    async fn fetch_bitmap(
        &self,
        pool: &Pool,
        words: &[WordIndex],
        _block: u64,
    ) -> Result<BTreeMap<WordIndex, U256>, ReaderError> {
        let state = self.states.get(&pool.id);
        Ok(words
            .iter()
            .map(|word| {
                let mask = state.map(|state| state.word(*word)).unwrap_or_default();
                (*word, mask)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::H256;

    use super::*;
    use crate::state::{apply_liquidity_update, LiquidityUpdate};

    fn v4_pool() -> Pool {
        Pool {
            id: PoolId::Id(H256::repeat_byte(0x44)),
            factory: Address::zero(),
            asset0: Address::repeat_byte(0x01),
            asset1: Address::repeat_byte(0x02),
            fee: 500,
            tick_spacing: 10,
            protocol: PoolKind::V4,
        }
    }

    #[tokio::test]
    async fn test_in_memory_reader_returns_zero_for_unknown_ticks() {
        let pool = v4_pool();
        let mut state = TickStateStore::new(10);
        apply_liquidity_update(
            &mut state,
            &LiquidityUpdate {
                tick_lower: -10,
                tick_upper: 10,
                liquidity_delta: 77,
                block_number: 1,
            },
        )
        .unwrap();
        let mut reader = InMemoryLiveStateReader::new();
        reader.insert(pool.id, state);

        let ticks = reader
            .fetch_ticks(&pool, &[TickIndex(-10), TickIndex(20)], 1)
            .await
            .unwrap();
        assert_eq!(
            ticks[&TickIndex(-10)],
            LiveTick {
                liquidity_net: 77,
                liquidity_gross: 77
            }
        );
        assert_eq!(ticks[&TickIndex(20)], LiveTick::default());

        let words = reader
            .fetch_bitmap(&pool, &[WordIndex(-1), WordIndex(0), WordIndex(5)], 1)
            .await
            .unwrap();
        assert_eq!(words[&WordIndex(-1)], U256::one() << 255);
        assert_eq!(words[&WordIndex(0)], U256::from(2u64));
        assert!(words[&WordIndex(5)].is_zero());
    }
}
