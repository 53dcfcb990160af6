use chrono::DateTime;
use ethers::abi::{decode, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;

use crate::event::{LiquidityEvent, LiquidityEventKind, RawLog};
use crate::types::{PoolId, PoolKind};

const V3_MINT_SIGNATURE: &str = "Mint(address,address,int24,int24,uint128,uint256,uint256)";
const V3_BURN_SIGNATURE: &str = "Burn(address,int24,int24,uint128,uint256,uint256)";
const V4_MODIFY_LIQUIDITY_SIGNATURE: &str =
    "ModifyLiquidity(bytes32,address,int24,int24,int256,bytes32)";

static V3_MINT_TOPIC: Lazy<H256> = Lazy::new(|| topic(V3_MINT_SIGNATURE));
static V3_BURN_TOPIC: Lazy<H256> = Lazy::new(|| topic(V3_BURN_SIGNATURE));
static V4_MODIFY_LIQUIDITY_TOPIC: Lazy<H256> = Lazy::new(|| topic(V4_MODIFY_LIQUIDITY_SIGNATURE));

static V3_TOPICS: Lazy<[H256; 2]> = Lazy::new(|| [*V3_MINT_TOPIC, *V3_BURN_TOPIC]);
static V4_TOPICS: Lazy<[H256; 1]> = Lazy::new(|| [*V4_MODIFY_LIQUIDITY_TOPIC]);

const INT24_MIN: i128 = -(1 << 23);
const INT24_MAX: i128 = (1 << 23) - 1;

fn topic(signature: &str) -> H256 {
    H256::from_slice(&keccak256(signature.as_bytes()))
}

fn topic_to_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

pub fn v3_mint_topic() -> H256 {
    *V3_MINT_TOPIC
}

pub fn v3_burn_topic() -> H256 {
    *V3_BURN_TOPIC
}

pub fn v4_modify_liquidity_topic() -> H256 {
    *V4_MODIFY_LIQUIDITY_TOPIC
}

/// 单条日志的解码错误，批处理中跳过并计数，不会中断整批。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("未知事件签名: topic0={topic0:?}, tx={transaction_hash:#x}")]
    UnknownSignature {
        topic0: Option<H256>,
        transaction_hash: H256,
    },
    #[error("事件数据格式错误: tx={transaction_hash:#x}, 原因: {reason}")]
    Malformed {
        transaction_hash: H256,
        reason: String,
    },
}

impl PoolKind {
    /// 该协议关心的 topic0 集合，便于统一订阅与过滤。
    pub fn event_topics(&self) -> &'static [H256] {
        match self {
            PoolKind::V3 => V3_TOPICS.as_slice(),
            PoolKind::V4 => V4_TOPICS.as_slice(),
        }
    }

    /// 按协议布局解码一条原始日志。
    pub fn decode_log(&self, log: &RawLog) -> Result<LiquidityEvent, DecodeError> {
        match self {
            PoolKind::V3 => decode_v3(log),
            PoolKind::V4 => decode_v4(log),
        }
    }
}

/// 一批日志的解码结果。
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub events: Vec<LiquidityEvent>,
    pub unknown_signature: usize,
    pub malformed: usize,
}

impl DecodedBatch {
    pub fn failures(&self) -> usize {
        self.unknown_signature + self.malformed
    }
}

/// 解码整批日志，失败的行记录告警后跳过。
pub fn decode_batch(kind: PoolKind, logs: &[RawLog]) -> DecodedBatch {
    let mut batch = DecodedBatch {
        events: Vec::with_capacity(logs.len()),
        ..DecodedBatch::default()
    };
    for log in logs {
        match kind.decode_log(log) {
            Ok(event) => batch.events.push(event),
            Err(err @ DecodeError::UnknownSignature { .. }) => {
                tracing::warn!(protocol = %kind, block = log.block_number, "跳过日志: {}", err);
                batch.unknown_signature += 1;
            }
            Err(err @ DecodeError::Malformed { .. }) => {
                tracing::warn!(protocol = %kind, block = log.block_number, "跳过日志: {}", err);
                batch.malformed += 1;
            }
        }
    }
    batch
}

fn decode_v3(log: &RawLog) -> Result<LiquidityEvent, DecodeError> {
    let topic0 = log.topic0();
    let is_mint = topic0 == Some(*V3_MINT_TOPIC);
    if !is_mint && topic0 != Some(*V3_BURN_TOPIC) {
        return Err(DecodeError::UnknownSignature {
            topic0,
            transaction_hash: log.transaction_hash,
        });
    }
    if log.topics.len() < 4 {
        return Err(malformed(log, format!("topic 数量不足: {}", log.topics.len())));
    }
    let tick_lower = topic_to_int24(log, &log.topics[2])?;
    let tick_upper = topic_to_int24(log, &log.topics[3])?;

    let (event_type, sender, amount, amount0, amount1) = if is_mint {
        check_address_word(log, 0)?;
        let decoded = decode_data(
            log,
            &[
                ParamType::Address,
                ParamType::Uint(128),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
        )?;
        let sender = decoded[0]
            .clone()
            .into_address()
            .ok_or_else(|| malformed(log, "sender 地址缺失".into()))?;
        (
            LiquidityEventKind::Mint,
            Some(sender),
            expect_uint(log, &decoded[1])?,
            expect_uint(log, &decoded[2])?,
            expect_uint(log, &decoded[3])?,
        )
    } else {
        let decoded = decode_data(
            log,
            &[ParamType::Uint(128), ParamType::Uint(256), ParamType::Uint(256)],
        )?;
        (
            LiquidityEventKind::Burn,
            None,
            expect_uint(log, &decoded[0])?,
            expect_uint(log, &decoded[1])?,
            expect_uint(log, &decoded[2])?,
        )
    };

    let magnitude = u256_to_i128(log, amount)?;
    let liquidity_delta = match event_type {
        LiquidityEventKind::Mint => magnitude,
        LiquidityEventKind::Burn => -magnitude,
    };

    Ok(LiquidityEvent {
        pool_id: PoolId::Address(log.address),
        block_number: log.block_number,
        transaction_index: log.transaction_index,
        log_index: log.log_index,
        transaction_hash: log.transaction_hash,
        event_type,
        tick_lower,
        tick_upper,
        liquidity_delta,
        sender,
        amount0,
        amount1,
        event_time: event_time(log),
    })
}

fn decode_v4(log: &RawLog) -> Result<LiquidityEvent, DecodeError> {
    let topic0 = log.topic0();
    if topic0 != Some(*V4_MODIFY_LIQUIDITY_TOPIC) {
        return Err(DecodeError::UnknownSignature {
            topic0,
            transaction_hash: log.transaction_hash,
        });
    }
    if log.topics.len() < 2 {
        return Err(malformed(log, format!("topic 数量不足: {}", log.topics.len())));
    }
    let pool_id = PoolId::Id(log.topics[1]);
    let sender = log.topics.get(2).map(topic_to_address);

    let decoded = decode_data(
        log,
        &[
            ParamType::Int(24),
            ParamType::Int(24),
            ParamType::Int(256),
            ParamType::FixedBytes(32),
        ],
    )?;
    let tick_lower = int24_from_word(log, expect_int(log, &decoded[0])?)?;
    let tick_upper = int24_from_word(log, expect_int(log, &decoded[1])?)?;
    let liquidity_delta = word_to_i128(expect_int(log, &decoded[2])?)
        .ok_or_else(|| malformed(log, "liquidityDelta 超出 int128 范围".into()))?;
    let event_type = if liquidity_delta > 0 {
        LiquidityEventKind::Mint
    } else {
        LiquidityEventKind::Burn
    };

    Ok(LiquidityEvent {
        pool_id,
        block_number: log.block_number,
        transaction_index: log.transaction_index,
        log_index: log.log_index,
        transaction_hash: log.transaction_hash,
        event_type,
        tick_lower,
        tick_upper,
        liquidity_delta,
        sender,
        amount0: U256::zero(),
        amount1: U256::zero(),
        event_time: event_time(log),
    })
}

fn malformed(log: &RawLog, reason: String) -> DecodeError {
    DecodeError::Malformed {
        transaction_hash: log.transaction_hash,
        reason,
    }
}

fn decode_data(log: &RawLog, params: &[ParamType]) -> Result<Vec<Token>, DecodeError> {
    let expected = params.len() * 32;
    if log.data.len() != expected {
        return Err(malformed(
            log,
            format!("data 长度应为 {} 字节，实际 {} 字节", expected, log.data.len()),
        ));
    }
    decode(params, &log.data).map_err(|err| malformed(log, err.to_string()))
}

/// ABI 地址字高 12 字节必须为零。
fn check_address_word(log: &RawLog, index: usize) -> Result<(), DecodeError> {
    let start = index * 32;
    match log.data.get(start..start + 12) {
        Some(padding) if padding.iter().all(|b| *b == 0) => Ok(()),
        Some(_) => Err(malformed(log, "地址字段高位非零".into())),
        None => Err(malformed(log, "data 长度不足".into())),
    }
}

fn expect_uint(log: &RawLog, token: &Token) -> Result<U256, DecodeError> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| malformed(log, "期待 Uint".into()))
}

fn expect_int(log: &RawLog, token: &Token) -> Result<U256, DecodeError> {
    token
        .clone()
        .into_int()
        .ok_or_else(|| malformed(log, "期待 Int".into()))
}

fn topic_to_int24(log: &RawLog, topic: &H256) -> Result<i32, DecodeError> {
    int24_from_word(log, U256::from_big_endian(topic.as_bytes()))
}

fn int24_from_word(log: &RawLog, word: U256) -> Result<i32, DecodeError> {
    match word_to_i128(word) {
        Some(value) if (INT24_MIN..=INT24_MAX).contains(&value) => Ok(value as i32),
        _ => Err(malformed(log, "tick 超出 int24 范围".into())),
    }
}

/// 将符号扩展的 256 位补码字转换为 i128，超出范围返回 None。
fn word_to_i128(word: U256) -> Option<i128> {
    let mut bytes = [0u8; 32];
    word.to_big_endian(&mut bytes);
    let (high, low) = bytes.split_at(16);
    let mut low_bytes = [0u8; 16];
    low_bytes.copy_from_slice(low);
    let value = i128::from_be_bytes(low_bytes);
    let fill = if value < 0 { 0xff } else { 0x00 };
    high.iter().all(|b| *b == fill).then_some(value)
}

/// V3 的 uint128 数量要转成有符号增量，超过 `i128::MAX` 时无法表示取反后的 Burn，
/// 按格式错误处理。链上单个 tick 的流动性上限远低于该值。
fn u256_to_i128(log: &RawLog, value: U256) -> Result<i128, DecodeError> {
    let unsigned: u128 = value
        .try_into()
        .map_err(|_| malformed(log, "流动性数量超过 u128".into()))?;
    i128::try_from(unsigned).map_err(|_| malformed(log, "流动性数量超过 int128".into()))
}

fn event_time(log: &RawLog) -> Option<chrono::DateTime<chrono::Utc>> {
    log.block_timestamp
        .and_then(|ts| i64::try_from(ts).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}
