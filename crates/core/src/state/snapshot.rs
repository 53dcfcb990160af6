use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{ConsistencyError, TickEntry, TickStateStore};
use crate::types::{Pool, PoolId, TickIndex, WordIndex};

/// 池子在某个区块的完整流动性快照，持久化时整体替换、从不局部写入。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool_id: PoolId,
    pub snapshot_block: u64,
    #[serde(with = "crate::serde_utils::u256_string_map")]
    pub tick_bitmap: BTreeMap<WordIndex, U256>,
    pub tick_data: BTreeMap<TickIndex, TickEntry>,
    pub pool: Pool,
    pub last_event_block: u64,
    pub total_ticks: usize,
    pub total_bitmap_words: usize,
    #[serde(default)]
    pub update_count: u64,
}

impl PoolSnapshot {
    /// 由内存工作状态生成快照，`update_count` 由存储在保存时维护。
    pub fn from_state(
        pool: &Pool,
        state: &TickStateStore,
        snapshot_block: u64,
        last_event_block: u64,
    ) -> Self {
        Self {
            pool_id: pool.id,
            snapshot_block,
            tick_bitmap: state.bitmap().clone(),
            tick_data: state.ticks().clone(),
            pool: pool.clone(),
            last_event_block,
            total_ticks: state.ticks().len(),
            total_bitmap_words: state.bitmap().len(),
            update_count: 0,
        }
    }

    /// 恢复为可继续回放的工作状态，恢复前做完整性校验。
    pub fn to_state(&self) -> Result<TickStateStore, ConsistencyError> {
        if self.total_ticks != self.tick_data.len()
            || self.total_bitmap_words != self.tick_bitmap.len()
        {
            return Err(ConsistencyError::BitmapMismatch {
                word: 0,
                reason: format!(
                    "快照计数与内容不符: total_ticks={}, ticks={}, total_bitmap_words={}, words={}",
                    self.total_ticks,
                    self.tick_data.len(),
                    self.total_bitmap_words,
                    self.tick_bitmap.len()
                ),
            });
        }
        TickStateStore::from_parts(
            self.pool.tick_spacing,
            self.tick_data.clone(),
            self.tick_bitmap.clone(),
        )
    }

    /// 不含 `update_count` 的序列化负载，用于比较两条回放路径的结果。
    pub fn state_payload(&self) -> Result<Vec<u8>, StoreError> {
        let mut normalized = self.clone();
        normalized.update_count = 0;
        serde_json::to_vec(&normalized).map_err(|err| StoreError::Serialize(err.to_string()))
    }
}

/// 快照存储汇总信息。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStatistics {
    pub total_snapshots: usize,
    pub total_ticks: usize,
    pub earliest_snapshot_block: Option<u64>,
    pub latest_snapshot_block: Option<u64>,
}

impl SnapshotStatistics {
    pub fn from_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a PoolSnapshot>) -> Self {
        let mut stats = Self::default();
        for snapshot in snapshots {
            stats.total_snapshots += 1;
            stats.total_ticks += snapshot.total_ticks;
            stats.earliest_snapshot_block = Some(
                stats
                    .earliest_snapshot_block
                    .map_or(snapshot.snapshot_block, |b| b.min(snapshot.snapshot_block)),
            );
            stats.latest_snapshot_block = Some(
                stats
                    .latest_snapshot_block
                    .map_or(snapshot.snapshot_block, |b| b.max(snapshot.snapshot_block)),
            );
        }
        stats
    }
}

/// 快照存储抽象，负责保存与恢复池子快照。
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, id: &PoolId) -> Result<Option<PoolSnapshot>, StoreError>;

    /// 整体替换池子快照，返回提交后的快照（`update_count` 已递增）。
    async fn save(&self, snapshot: PoolSnapshot) -> Result<PoolSnapshot, StoreError>;

    async fn remove(&self, id: &PoolId) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<PoolSnapshot>, StoreError>;

    async fn last_snapshot_block(&self, id: &PoolId) -> Result<Option<u64>, StoreError> {
        Ok(self.load(id).await?.map(|snapshot| snapshot.snapshot_block))
    }

    async fn statistics(&self) -> Result<SnapshotStatistics, StoreError> {
        let snapshots = self.list().await?;
        Ok(SnapshotStatistics::from_snapshots(&snapshots))
    }
}

/// 快照存储错误。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("序列化失败: {0}")]
    Serialize(String),
    #[error("IO 错误: {0}")]
    Io(String),
    #[error("存储后端错误: {0}")]
    Backend(String),
}

/// 内存快照存储，用于测试与单次运行。
#[derive(Debug, Default, Clone)]
pub struct InMemorySnapshotStore {
    inner: Arc<RwLock<HashMap<PoolId, PoolSnapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, id: &PoolId) -> Result<Option<PoolSnapshot>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn save(&self, mut snapshot: PoolSnapshot) -> Result<PoolSnapshot, StoreError> {
        let mut guard = self.inner.write().await;
        snapshot.update_count = guard
            .get(&snapshot.pool_id)
            .map_or(1, |previous| previous.update_count + 1);
        guard.insert(snapshot.pool_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn remove(&self, id: &PoolId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PoolSnapshot>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.values().cloned().collect())
    }
}

/// 基于本地文件系统的 YAML 快照存储，每个池子一个文件。
///
/// 写入先落临时文件再原子重命名，读者不会看到半截快照。
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
    chain_id: u64,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(root: P, chain_id: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            chain_id,
        }
    }

    fn file_name(&self, id: &PoolId) -> String {
        format!("{}_{}.yaml", self.chain_id, id)
    }

    fn snapshot_path(&self, id: &PoolId) -> PathBuf {
        self.root.join(self.file_name(id))
    }

    async fn read_snapshot(path: &Path) -> Result<Option<PoolSnapshot>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_yaml::from_slice(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Serialize(format!("{}: {}", path.display(), err))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err.to_string())),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, id: &PoolId) -> Result<Option<PoolSnapshot>, StoreError> {
        Self::read_snapshot(&self.snapshot_path(id)).await
    }

    async fn save(&self, mut snapshot: PoolSnapshot) -> Result<PoolSnapshot, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;

        let path = self.snapshot_path(&snapshot.pool_id);
        snapshot.update_count = Self::read_snapshot(&path)
            .await?
            .map_or(1, |previous| previous.update_count + 1);

        let serialized =
            serde_yaml::to_string(&snapshot).map_err(|err| StoreError::Serialize(err.to_string()))?;
        let tmp_path = self
            .root
            .join(format!(".{}.tmp", self.file_name(&snapshot.pool_id)));
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;
        file.write_all(serialized.as_bytes())
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;
        file.sync_all()
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;
        drop(file);
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;

        tracing::debug!(
            pool = %snapshot.pool_id,
            block = snapshot.snapshot_block,
            ticks = snapshot.total_ticks,
            "快照已写入: {:?}",
            path
        );
        Ok(snapshot)
    }

    async fn remove(&self, id: &PoolId) -> Result<(), StoreError> {
        match fs::remove_file(self.snapshot_path(id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<PoolSnapshot>, StoreError> {
        let mut snapshots = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };

        let prefix = format!("{}_", self.chain_id);
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?
        {
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(&prefix) && name.ends_with(".yaml"))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            match Self::read_snapshot(&path).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("读取快照文件失败: {:?}, 错误: {}", path, err);
                }
            }
        }

        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Address;

    use super::*;
    use crate::state::{apply_liquidity_update, LiquidityUpdate};
    use crate::types::PoolKind;

    fn sample_pool() -> Pool {
        Pool {
            id: PoolId::Address(Address::repeat_byte(0x33)),
            factory: Address::repeat_byte(0x01),
            asset0: Address::repeat_byte(0x11),
            asset1: Address::repeat_byte(0x22),
            fee: 3_000,
            tick_spacing: 60,
            protocol: PoolKind::V3,
        }
    }

    fn sample_snapshot(block: u64) -> PoolSnapshot {
        let pool = sample_pool();
        let mut state = TickStateStore::new(pool.tick_spacing);
        let positions = [(-887_220, 887_220, 7i128), (-120, 60, 1_000), (60, 15_360, 3)];
        for (lower, upper, delta) in positions {
            apply_liquidity_update(
                &mut state,
                &LiquidityUpdate {
                    tick_lower: lower,
                    tick_upper: upper,
                    liquidity_delta: delta,
                    block_number: block,
                },
            )
            .unwrap();
        }
        PoolSnapshot::from_state(&pool, &state, block, block)
    }

    #[tokio::test]
    async fn test_in_memory_round_trip_and_update_count() {
        let store = InMemorySnapshotStore::new();
        let snapshot = sample_snapshot(10);
        let id = snapshot.pool_id;

        let first = store.save(snapshot.clone()).await.unwrap();
        assert_eq!(first.update_count, 1);
        let second = store.save(snapshot.clone()).await.unwrap();
        assert_eq!(second.update_count, 2);

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.tick_data, snapshot.tick_data);
        assert_eq!(loaded.tick_bitmap, snapshot.tick_bitmap);
        assert_eq!(loaded.pool, snapshot.pool);
        assert_eq!(store.last_snapshot_block(&id).await.unwrap(), Some(10));
        assert_eq!(loaded.to_state().unwrap().ticks().len(), 5);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 1);
        let snapshot = sample_snapshot(42);
        let id = snapshot.pool_id;

        assert!(store.load(&id).await.unwrap().is_none());
        store.save(snapshot.clone()).await.unwrap();
        let saved = store.save(snapshot.clone()).await.unwrap();
        assert_eq!(saved.update_count, 2);

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.state_payload().unwrap(), snapshot.state_payload().unwrap());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_list_statistics_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 1);
        let first = sample_snapshot(5);
        let mut second = sample_snapshot(9);
        second.pool_id = PoolId::Id(ethers::types::H256::repeat_byte(0x99));
        second.pool.id = second.pool_id;
        store.save(first.clone()).await.unwrap();
        store.save(second.clone()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_snapshots, 2);
        assert_eq!(stats.total_ticks, first.total_ticks + second.total_ticks);
        assert_eq!(stats.earliest_snapshot_block, Some(5));
        assert_eq!(stats.latest_snapshot_block, Some(9));

        store.remove(&first.pool_id).await.unwrap();
        store.remove(&first.pool_id).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_to_state_rejects_tampered_counts() {
        let mut snapshot = sample_snapshot(1);
        snapshot.total_ticks += 1;
        assert!(snapshot.to_state().is_err());

        let mut snapshot = sample_snapshot(1);
        let word = *snapshot.tick_bitmap.keys().next().unwrap();
        snapshot.tick_bitmap.insert(word, U256::zero());
        assert!(matches!(
            snapshot.to_state(),
            Err(ConsistencyError::BitmapMismatch { .. })
        ));
    }
}
