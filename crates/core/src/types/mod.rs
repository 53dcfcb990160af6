use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, H256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 协议允许的最小 tick。
pub const MIN_TICK: i32 = -887_272;
/// 协议允许的最大 tick。
pub const MAX_TICK: i32 = 887_272;

/// 池子协议版本，决定事件布局与链上读取方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolKind {
    #[serde(rename = "v3")]
    V3,
    #[serde(rename = "v4")]
    V4,
}

impl PoolKind {
    /// 返回带版本的协议标签字符串。
    pub fn label(&self) -> &'static str {
        match self {
            PoolKind::V3 => "uniswap_v3",
            PoolKind::V4 => "uniswap_v4",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PoolKind {
    type Err = PoolIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v3" | "uniswap_v3" => Ok(PoolKind::V3),
            "v4" | "uniswap_v4" => Ok(PoolKind::V4),
            other => Err(PoolIdParseError(format!("未知协议: {}", other))),
        }
    }
}

/// 池子唯一标识：V3 使用合约地址，V4 使用 32 字节 PoolId。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolId {
    Address(Address),
    Id(H256),
}

impl PoolId {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PoolId::Address(address) => address.as_bytes(),
            PoolId::Id(id) => id.as_bytes(),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.as_bytes()))
    }
}

impl From<Address> for PoolId {
    fn from(address: Address) -> Self {
        PoolId::Address(address)
    }
}

impl From<H256> for PoolId {
    fn from(id: H256) -> Self {
        PoolId::Id(id)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("池子标识解析失败: {0}")]
pub struct PoolIdParseError(pub String);

impl FromStr for PoolId {
    type Err = PoolIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(raw).map_err(|err| PoolIdParseError(err.to_string()))?;
        match bytes.len() {
            20 => Ok(PoolId::Address(Address::from_slice(&bytes))),
            32 => Ok(PoolId::Id(H256::from_slice(&bytes))),
            other => Err(PoolIdParseError(format!(
                "长度应为 20 或 32 字节，实际 {} 字节",
                other
            ))),
        }
    }
}

impl Serialize for PoolId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PoolId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 池子静态元数据，由外部池子注册表维护，引擎只读。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub factory: Address,
    pub asset0: Address,
    pub asset1: Address,
    pub fee: u32,
    pub tick_spacing: i32,
    pub protocol: PoolKind,
}

/// tick 下标。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickIndex(pub i32);

impl TickIndex {
    /// 按 tick 间距压缩后的下标（向下取整）。
    pub fn compressed(self, tick_spacing: i32) -> i32 {
        self.0.div_euclid(tick_spacing)
    }

    /// 返回该 tick 在位图中的 (字, 位) 坐标。
    pub fn position(self, tick_spacing: i32) -> (WordIndex, u8) {
        let compressed = self.compressed(tick_spacing);
        // 压缩后的 tick 在 ±887272 内，右移 8 位后必然落在 i16 范围。
        let word = (compressed >> 8) as i16;
        let bit = compressed.rem_euclid(256) as u8;
        (WordIndex(word), bit)
    }

    pub fn is_aligned(self, tick_spacing: i32) -> bool {
        tick_spacing > 0 && self.0 % tick_spacing == 0
    }
}

impl fmt::Display for TickIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 位图字下标，对应链上 `tickBitmap` 的 int16 键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WordIndex(pub i16);

impl WordIndex {
    /// 位图字中第 `bit` 位对应的 tick。
    pub fn tick_at(self, bit: u8, tick_spacing: i32) -> TickIndex {
        TickIndex((i32::from(self.0) * 256 + i32::from(bit)) * tick_spacing)
    }

    /// 给定间距下覆盖全部合法 tick 的位图字范围。
    pub fn full_range(tick_spacing: i32) -> std::ops::RangeInclusive<i16> {
        let (min, _) = TickIndex(MIN_TICK).position(tick_spacing);
        let (max, _) = TickIndex(MAX_TICK).position(tick_spacing);
        min.0..=max.0
    }
}

impl fmt::Display for WordIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
