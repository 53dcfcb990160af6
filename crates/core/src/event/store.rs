use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::LiquidityEvent;
use crate::types::PoolId;

/// 只追加的流动性事件日志，用于审计与分析，不参与快照正确性。
#[async_trait]
pub trait EventLogSink: Send + Sync {
    /// 追加一批事件，返回实际写入条数。
    async fn append_batch(&self, events: &[LiquidityEvent]) -> Result<usize, EventLogError>;

    /// 已写入事件中最大的区块号。
    async fn last_processed_block(&self) -> Result<Option<u64>, EventLogError>;

    /// 读取某个池子在 `[from_block, to_block]` 内的事件，按全序键排序。
    async fn updates_in_range(
        &self,
        pool: &PoolId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LiquidityEvent>, EventLogError>;
}

#[derive(thiserror::Error, Debug)]
pub enum EventLogError {
    #[error("事件日志 IO 错误: {0}")]
    Io(String),
    #[error("事件日志序列化失败: {0}")]
    Serialize(String),
}

fn select_range(
    events: impl Iterator<Item = LiquidityEvent>,
    pool: &PoolId,
    from_block: u64,
    to_block: u64,
) -> Vec<LiquidityEvent> {
    let mut selected: Vec<LiquidityEvent> = events
        .filter(|event| {
            event.pool_id == *pool
                && event.block_number >= from_block
                && event.block_number <= to_block
        })
        .collect();
    super::sort_events(&mut selected);
    selected
}

/// 内存事件日志，用于阶段构建与单测。
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventLog {
    inner: Arc<RwLock<Vec<LiquidityEvent>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl EventLogSink for InMemoryEventLog {
    async fn append_batch(&self, events: &[LiquidityEvent]) -> Result<usize, EventLogError> {
        let mut guard = self.inner.write().await;
        guard.extend_from_slice(events);
        Ok(events.len())
    }

    async fn last_processed_block(&self) -> Result<Option<u64>, EventLogError> {
        let guard = self.inner.read().await;
        Ok(guard.iter().map(|event| event.block_number).max())
    }

    async fn updates_in_range(
        &self,
        pool: &PoolId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LiquidityEvent>, EventLogError> {
        let guard = self.inner.read().await;
        Ok(select_range(guard.iter().cloned(), pool, from_block, to_block))
    }
}

/// JSON lines 格式的事件日志文件，每行一条事件。
#[derive(Debug)]
pub struct JsonLinesEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesEventLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<LiquidityEvent>, EventLogError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(EventLogError::Io(err.to_string())),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| EventLogError::Serialize(err.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl EventLogSink for JsonLinesEventLog {
    async fn append_batch(&self, events: &[LiquidityEvent]) -> Result<usize, EventLogError> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut buffer = String::new();
        for event in events {
            let line =
                serde_json::to_string(event)
                    .map_err(|err| EventLogError::Serialize(err.to_string()))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| EventLogError::Io(err.to_string()))?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| EventLogError::Io(err.to_string()))?;
        file.write_all(buffer.as_bytes())
            .await
            .map_err(|err| EventLogError::Io(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| EventLogError::Io(err.to_string()))?;
        Ok(events.len())
    }

    async fn last_processed_block(&self) -> Result<Option<u64>, EventLogError> {
        Ok(self
            .read_all()
            .await?
            .iter()
            .map(|event| event.block_number)
            .max())
    }

    async fn updates_in_range(
        &self,
        pool: &PoolId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LiquidityEvent>, EventLogError> {
        let events = self.read_all().await?;
        Ok(select_range(events.into_iter(), pool, from_block, to_block))
    }
}
