#![allow(dead_code)]

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, I256, U256};
use liquidity_snapshot_core::event::decoder::{
    v3_burn_topic, v3_mint_topic, v4_modify_liquidity_topic,
};
use liquidity_snapshot_core::event::RawLog;
use liquidity_snapshot_core::types::{Pool, PoolId, PoolKind};

/// 日志在链上的位置：(区块, 交易序号, 日志序号)。
pub type Position = (u64, u64, u64);

fn int_topic(value: i32) -> H256 {
    let mut bytes = [0u8; 32];
    I256::from(value).into_raw().to_big_endian(&mut bytes);
    H256::from(bytes)
}

fn int_token(value: i128) -> Token {
    Token::Int(I256::from(value).into_raw())
}

fn tx_hash((block, tx, log): Position) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[8..16].copy_from_slice(&block.to_be_bytes());
    bytes[16..24].copy_from_slice(&tx.to_be_bytes());
    bytes[24..32].copy_from_slice(&log.to_be_bytes());
    H256::from(bytes)
}

fn raw_log(address: Address, topics: Vec<H256>, data: Vec<u8>, position: Position) -> RawLog {
    RawLog {
        address,
        topics,
        data: Bytes::from(data),
        block_number: position.0,
        transaction_index: position.1,
        log_index: position.2,
        transaction_hash: tx_hash(position),
        block_timestamp: Some(1_700_000_000 + position.0 * 12),
    }
}

pub fn v3_mint(pool: Address, lower: i32, upper: i32, amount: u128, position: Position) -> RawLog {
    let data = encode(&[
        Token::Address(Address::repeat_byte(0xaa)),
        Token::Uint(U256::from(amount)),
        Token::Uint(U256::from(amount / 2)),
        Token::Uint(U256::from(amount / 3)),
    ]);
    let topics = vec![
        v3_mint_topic(),
        H256::from(Address::repeat_byte(0xbb)),
        int_topic(lower),
        int_topic(upper),
    ];
    raw_log(pool, topics, data, position)
}

pub fn v3_burn(pool: Address, lower: i32, upper: i32, amount: u128, position: Position) -> RawLog {
    let data = encode(&[
        Token::Uint(U256::from(amount)),
        Token::Uint(U256::zero()),
        Token::Uint(U256::zero()),
    ]);
    let topics = vec![
        v3_burn_topic(),
        H256::from(Address::repeat_byte(0xbb)),
        int_topic(lower),
        int_topic(upper),
    ];
    raw_log(pool, topics, data, position)
}

pub fn v4_modify(pool_id: H256, lower: i32, upper: i32, delta: i128, position: Position) -> RawLog {
    let data = encode(&[
        int_token(i128::from(lower)),
        int_token(i128::from(upper)),
        int_token(delta),
        Token::FixedBytes(vec![0u8; 32]),
    ]);
    let topics = vec![
        v4_modify_liquidity_topic(),
        pool_id,
        H256::from(Address::repeat_byte(0xcc)),
    ];
    raw_log(Address::repeat_byte(0x44), topics, data, position)
}

pub fn v3_pool(address: Address, tick_spacing: i32) -> Pool {
    Pool {
        id: PoolId::Address(address),
        factory: Address::repeat_byte(0x01),
        asset0: Address::repeat_byte(0x11),
        asset1: Address::repeat_byte(0x22),
        fee: 3_000,
        tick_spacing,
        protocol: PoolKind::V3,
    }
}

pub fn v4_pool(id: H256, tick_spacing: i32) -> Pool {
    Pool {
        id: PoolId::Id(id),
        factory: Address::repeat_byte(0x44),
        asset0: Address::zero(),
        asset1: Address::repeat_byte(0x22),
        fee: 500,
        tick_spacing,
        protocol: PoolKind::V4,
    }
}
