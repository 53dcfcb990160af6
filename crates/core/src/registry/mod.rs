use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::Address;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::event::LiquidityEvent;
use crate::types::{Pool, PoolId, PoolKind};

/// 池子注册表：按标识提供只读的池子元数据。
#[async_trait]
pub trait PoolRegistry: Send + Sync {
    async fn lookup(&self, id: &PoolId) -> Option<Pool>;

    async fn pools(&self, kind: PoolKind) -> Vec<Pool>;

    /// 返回这批事件涉及、且注册表中已知的池子集合。
    async fn tracked_pools_with_events(
        &self,
        kind: PoolKind,
        events: &[LiquidityEvent],
    ) -> BTreeSet<PoolId> {
        let candidates: BTreeSet<PoolId> = events.iter().map(|event| event.pool_id).collect();
        let mut tracked = BTreeSet::new();
        for id in candidates {
            match self.lookup(&id).await {
                Some(pool) if pool.protocol == kind => {
                    tracked.insert(id);
                }
                _ => {}
            }
        }
        tracked
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("注册表读取失败: {0}")]
    Io(String),
    #[error("注册表解析失败: {0}")]
    Parse(String),
    #[error("地址解析失败: {0}")]
    Address(String),
    #[error("池子配置无效: {pool}, {reason}")]
    InvalidPool { pool: String, reason: String },
}

/// 内存池子注册表。
#[derive(Debug, Default, Clone)]
pub struct InMemoryPoolRegistry {
    inner: Arc<RwLock<HashMap<PoolId, Pool>>>,
}

impl InMemoryPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pools(pools: impl IntoIterator<Item = Pool>) -> Self {
        let map = pools.into_iter().map(|pool| (pool.id, pool)).collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn insert(&self, pool: Pool) {
        let mut guard = self.inner.write().await;
        guard.insert(pool.id, pool);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// 从 YAML 文件加载注册表。
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| RegistryError::Io(format!("{}: {}", path.as_ref().display(), err)))?;
        Self::load_yaml_str(&raw)
    }

    pub fn load_yaml_str(raw: &str) -> Result<Self, RegistryError> {
        let pools = parse_pools(raw)?;
        tracing::info!("池子注册表加载完成: {} 个池子", pools.len());
        Ok(Self::from_pools(pools))
    }
}

#[async_trait]
impl PoolRegistry for InMemoryPoolRegistry {
    async fn lookup(&self, id: &PoolId) -> Option<Pool> {
        let guard = self.inner.read().await;
        guard.get(id).cloned()
    }

    async fn pools(&self, kind: PoolKind) -> Vec<Pool> {
        let guard = self.inner.read().await;
        let mut pools: Vec<Pool> = guard
            .values()
            .filter(|pool| pool.protocol == kind)
            .cloned()
            .collect();
        pools.sort_by_key(|pool| pool.id);
        pools
    }
}

/// 注册表文件中的单条池子配置。
#[derive(Debug, Clone, Deserialize)]
struct PoolEntryConfig {
    id: String,
    #[serde(default)]
    factory: Option<String>,
    asset0: String,
    asset1: String,
    fee: u32,
    tick_spacing: i32,
    protocol: PoolKind,
}

fn parse_address(raw: &str) -> Result<Address, RegistryError> {
    Address::from_str(raw.trim()).map_err(|err| RegistryError::Address(format!("{}: {}", raw, err)))
}

impl PoolEntryConfig {
    fn into_pool(self) -> Result<Pool, RegistryError> {
        let id = PoolId::from_str(&self.id).map_err(|err| RegistryError::InvalidPool {
            pool: self.id.clone(),
            reason: err.to_string(),
        })?;
        let id_matches = matches!(
            (self.protocol, id),
            (PoolKind::V3, PoolId::Address(_)) | (PoolKind::V4, PoolId::Id(_))
        );
        if !id_matches {
            return Err(RegistryError::InvalidPool {
                pool: self.id,
                reason: format!("{} 池子的标识长度不符", self.protocol),
            });
        }
        if self.tick_spacing <= 0 {
            return Err(RegistryError::InvalidPool {
                pool: self.id,
                reason: format!("tick_spacing 必须为正数，实际 {}", self.tick_spacing),
            });
        }
        let factory = match self.factory.as_deref() {
            Some(raw) => parse_address(raw)?,
            None => Address::zero(),
        };
        Ok(Pool {
            id,
            factory,
            asset0: parse_address(&self.asset0)?,
            asset1: parse_address(&self.asset1)?,
            fee: self.fee,
            tick_spacing: self.tick_spacing,
            protocol: self.protocol,
        })
    }
}

fn parse_pools(raw: &str) -> Result<Vec<Pool>, RegistryError> {
    let configs: Vec<PoolEntryConfig> =
        serde_yaml::from_str(raw).map_err(|err| RegistryError::Parse(err.to_string()))?;
    configs.into_iter().map(PoolEntryConfig::into_pool).collect()
}
