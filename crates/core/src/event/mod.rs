pub mod decoder;
pub mod source;
pub mod store;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

use crate::types::PoolId;

/// 原始链上日志行，由事件源产出，尚未解码。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_timestamp: Option<u64>,
}

impl RawLog {
    pub fn topic0(&self) -> Option<H256> {
        self.topics.first().copied()
    }
}

/// 流动性事件方向，仅用于报表，更新引擎只关心带符号的 delta。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiquidityEventKind {
    Mint,
    Burn,
}

/// 事件全序键：(区块号, 交易序号, 日志序号)。
pub type EventKey = (u64, u64, u64);

/// 解码后的流动性事件，V3 与 V4 共用同一表示。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityEvent {
    pub pool_id: PoolId,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub transaction_hash: H256,
    pub event_type: LiquidityEventKind,
    pub tick_lower: i32,
    pub tick_upper: i32,
    #[serde(with = "crate::serde_utils::i128_string")]
    pub liquidity_delta: i128,
    #[serde(default)]
    pub sender: Option<Address>,
    #[serde(with = "crate::serde_utils::u256_string")]
    pub amount0: U256,
    #[serde(with = "crate::serde_utils::u256_string")]
    pub amount1: U256,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

impl LiquidityEvent {
    pub fn key(&self) -> EventKey {
        (self.block_number, self.transaction_index, self.log_index)
    }
}

/// 按全序键稳定排序。
pub fn sort_events(events: &mut [LiquidityEvent]) {
    events.sort_by_key(LiquidityEvent::key);
}
