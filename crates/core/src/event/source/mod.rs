pub mod ethers;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::RawLog;
use crate::types::PoolKind;

pub use self::ethers::{EthersLogSource, EthersLogSourceConfig};

/// 原始日志来源：按区块区间提供某个协议的流动性日志。
///
/// 返回顺序不作保证，调用方自行排序。
#[async_trait]
pub trait LogSource: Send + Sync {
    /// 读取 `[from_block, to_block]` 闭区间内该协议的日志。
    async fn load_range(
        &self,
        kind: PoolKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SourceError>;

    /// 该协议当前可用的最新事件区块，没有任何事件时返回 `None`。
    async fn latest_block(&self, kind: PoolKind) -> Result<Option<u64>, SourceError>;
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("网络错误: {0}")]
    Network(String),
    #[error("读取日志文件失败: {0}")]
    Io(String),
    #[error("日志文件第 {line} 行解析失败: {reason}")]
    Parse { line: usize, reason: String },
    #[error("日志缺少字段: {0}")]
    MissingField(&'static str),
}

fn matches_kind(kind: PoolKind, log: &RawLog) -> bool {
    log.topic0()
        .map(|topic| kind.event_topics().contains(&topic))
        .unwrap_or(false)
}

/// 内存日志源，用于测试与离线回放。
#[derive(Debug, Default, Clone)]
pub struct InMemoryLogSource {
    inner: Arc<RwLock<Vec<RawLog>>>,
}

impl InMemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_logs(logs: Vec<RawLog>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(logs)),
        }
    }

    pub async fn push(&self, log: RawLog) {
        self.inner.write().await.push(log);
    }

    pub async fn extend(&self, logs: impl IntoIterator<Item = RawLog> + Send) {
        self.inner.write().await.extend(logs);
    }
}

#[async_trait]
impl LogSource for InMemoryLogSource {
    async fn load_range(
        &self,
        kind: PoolKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SourceError> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .filter(|log| matches_kind(kind, log))
            .cloned()
            .collect())
    }

    async fn latest_block(&self, kind: PoolKind) -> Result<Option<u64>, SourceError> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .filter(|log| matches_kind(kind, log))
            .map(|log| log.block_number)
            .max())
    }
}

/// JSON lines 格式的原始日志文件，每行一条 [`RawLog`]。
#[derive(Debug, Clone)]
pub struct JsonLinesLogSource {
    logs: InMemoryLogSource,
}

impl JsonLinesLogSource {
    /// 打开并一次性读入日志文件，空行忽略。
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|err| SourceError::Io(format!("{}: {}", path.as_ref().display(), err)))?;
        let mut logs = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let log: RawLog = serde_json::from_str(line).map_err(|err| SourceError::Parse {
                line: index + 1,
                reason: err.to_string(),
            })?;
            logs.push(log);
        }
        tracing::info!(
            "日志文件加载完成: {:?}, 共 {} 条",
            path.as_ref(),
            logs.len()
        );
        Ok(Self {
            logs: InMemoryLogSource::from_logs(logs),
        })
    }
}

#[async_trait]
impl LogSource for JsonLinesLogSource {
    async fn load_range(
        &self,
        kind: PoolKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SourceError> {
        self.logs.load_range(kind, from_block, to_block).await
    }

    async fn latest_block(&self, kind: PoolKind) -> Result<Option<u64>, SourceError> {
        self.logs.latest_block(kind).await
    }
}
