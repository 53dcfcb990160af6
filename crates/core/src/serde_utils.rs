use std::collections::BTreeMap;

use ethers::types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// 数值既可能以字符串也可能以整数出现，统一先收敛为字符串再解析。
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    String(String),
    Unsigned(u64),
    Signed(i64),
}

impl Numeric {
    fn into_text(self) -> String {
        match self {
            Numeric::String(s) => s,
            Numeric::Unsigned(v) => v.to_string(),
            Numeric::Signed(v) => v.to_string(),
        }
    }
}

pub mod u128_string {
    use super::*;

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        Numeric::deserialize(deserializer)?
            .into_text()
            .parse::<u128>()
            .map_err(|err| de::Error::custom(format!("解析 u128 失败: {}", err)))
    }
}

pub mod i128_string {
    use super::*;

    pub fn serialize<S>(value: &i128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i128, D::Error>
    where
        D: Deserializer<'de>,
    {
        Numeric::deserialize(deserializer)?
            .into_text()
            .parse::<i128>()
            .map_err(|err| de::Error::custom(format!("解析 i128 失败: {}", err)))
    }
}

pub mod u256_string {
    use super::*;

    pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Numeric::deserialize(deserializer)?.into_text();
        U256::from_dec_str(&text).map_err(de::Error::custom)
    }
}

/// 以十进制字符串编码值的 U256 映射，例如位图字 -> 掩码。
pub mod u256_string_map {
    use super::*;

    pub fn serialize<K, S>(value: &BTreeMap<K, U256>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        serializer.collect_map(value.iter().map(|(k, v)| (k, v.to_string())))
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<BTreeMap<K, U256>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<K, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                U256::from_dec_str(&v)
                    .map(|mask| (k, mask))
                    .map_err(|err| de::Error::custom(format!("解析 U256 失败: {}", err)))
            })
            .collect()
    }
}
