use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ethers::types::H256;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::event::decoder::decode_batch;
use crate::event::source::{LogSource, SourceError};
use crate::event::store::EventLogSink;
use crate::event::{sort_events, LiquidityEvent};
use crate::registry::PoolRegistry;
use crate::state::snapshot::{SnapshotStore, StoreError};
use crate::state::{
    apply_liquidity_update, ConsistencyError, LiquidityUpdate, PoolSnapshot, TickStateStore,
};
use crate::types::{Pool, PoolId, PoolKind};

/// 默认区块分段大小。
pub const DEFAULT_BLOCK_CHUNK_SIZE: u64 = 100_000;

/// 回放参数。
#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    pub block_chunk_size: u64,
    /// 同一区块段内并行回放的池子数上限。
    pub max_concurrency: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            block_chunk_size: DEFAULT_BLOCK_CHUNK_SIZE,
            max_concurrency: 8,
        }
    }
}

/// 一次回放请求。
#[derive(Debug, Clone, Copy)]
pub struct ReplayRequest {
    pub kind: PoolKind,
    /// 为空时由各池子已有快照推导。
    pub start_block: Option<u64>,
    /// 为空时取事件源的最新事件区块。
    pub end_block: Option<u64>,
    pub force_rebuild: bool,
}

impl ReplayRequest {
    pub fn incremental(kind: PoolKind) -> Self {
        Self {
            kind,
            start_block: None,
            end_block: None,
            force_rebuild: false,
        }
    }

    pub fn rebuild(kind: PoolKind) -> Self {
        Self {
            force_rebuild: true,
            ..Self::incremental(kind)
        }
    }

    pub fn until(mut self, end_block: u64) -> Self {
        self.end_block = Some(end_block);
        self
    }
}

/// 某个池子在回放中遇到的一致性错误，附带触发事件的位置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolFailure {
    pub pool_id: PoolId,
    pub error: String,
    #[serde(skip)]
    pub kind: Option<ConsistencyError>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<H256>,
}

/// 回放结果汇总。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub protocol: PoolKind,
    pub start_block: u64,
    pub end_block: u64,
    pub chunks: usize,
    pub raw_logs: usize,
    pub events_decoded: usize,
    pub decode_failures: usize,
    pub unknown_pool_events: usize,
    pub events_applied: usize,
    /// 已被快照覆盖而跳过的事件数。
    pub events_skipped: usize,
    pub pools_updated: usize,
    pub snapshots_persisted: usize,
    pub events_logged: usize,
    pub failed_pools: Vec<PoolFailure>,
}

impl ReplaySummary {
    fn empty(protocol: PoolKind, start_block: u64, end_block: u64) -> Self {
        Self {
            protocol,
            start_block,
            end_block,
            chunks: 0,
            raw_logs: 0,
            events_decoded: 0,
            decode_failures: 0,
            unknown_pool_events: 0,
            events_applied: 0,
            events_skipped: 0,
            pools_updated: 0,
            snapshots_persisted: 0,
            events_logged: 0,
            failed_pools: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed_pools.is_empty()
    }
}

/// 同步相关错误。
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("事件源错误: {0}")]
    Source(#[from] SourceError),
    #[error("快照存储错误: pool={pool}, {source}")]
    Store { pool: PoolId, source: StoreError },
    #[error("回放任务异常退出: {0}")]
    Task(String),
    #[error("快照不一致: {0}")]
    Consistency(#[from] ConsistencyError),
}

impl From<(PoolId, StoreError)> for SyncError {
    fn from((pool, source): (PoolId, StoreError)) -> Self {
        SyncError::Store { pool, source }
    }
}

/// 单个池子的工作状态，由当前处理它的任务独占。
#[derive(Debug)]
struct PoolCursor {
    pool: Pool,
    state: TickStateStore,
    /// 已持久化的快照区块，这之前（含）的事件不再回放。
    persisted_block: Option<u64>,
}

struct PoolChunkOutcome {
    cursor: PoolCursor,
    applied: usize,
    skipped: usize,
    persisted: bool,
}

enum PoolChunkError {
    Consistency(PoolFailure),
    Store(PoolId, StoreError),
}

/// 快照管理器：分段回放流动性事件并为每个池子落盘快照。
pub struct SnapshotManager {
    source: Arc<dyn LogSource>,
    registry: Arc<dyn PoolRegistry>,
    store: Arc<dyn SnapshotStore>,
    event_log: Option<Arc<dyn EventLogSink>>,
    config: ReplayConfig,
}

impl SnapshotManager {
    pub fn new(
        source: Arc<dyn LogSource>,
        registry: Arc<dyn PoolRegistry>,
        store: Arc<dyn SnapshotStore>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            source,
            registry,
            store,
            event_log: None,
            config,
        }
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLogSink>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub async fn last_snapshot_block(&self, pool: &PoolId) -> Result<Option<u64>, SyncError> {
        self.store
            .last_snapshot_block(pool)
            .await
            .map_err(|err| SyncError::from((*pool, err)))
    }

    /// 起始区块：强制重建总是从 0 开始；增量模式下显式起点不会越过
    /// 任何池子的下一个未回放区块。
    async fn resolve_start_block(&self, request: &ReplayRequest) -> Result<u64, SyncError> {
        if request.force_rebuild {
            if let Some(start) = request.start_block.filter(|start| *start > 0) {
                tracing::warn!(
                    "{} 强制重建忽略显式起始区块 {}，从 0 开始",
                    request.kind,
                    start
                );
            }
            return Ok(0);
        }
        let resume = self.resume_block(request.kind).await?;
        match request.start_block {
            Some(start) if start > resume => {
                tracing::warn!(
                    "{} 显式起始区块 {} 晚于待回放区块 {}，改为从 {} 开始",
                    request.kind,
                    start,
                    resume,
                    resume
                );
                Ok(resume)
            }
            Some(start) => Ok(start),
            None => Ok(resume),
        }
    }

    /// 所有已注册池子中最早的未回放区块，任一池子没有快照时为 0。
    async fn resume_block(&self, kind: PoolKind) -> Result<u64, SyncError> {
        let pools = self.registry.pools(kind).await;
        let mut start: Option<u64> = None;
        for pool in &pools {
            let next = match self.last_snapshot_block(&pool.id).await? {
                Some(block) => block.saturating_add(1),
                None => return Ok(0),
            };
            start = Some(start.map_or(next, |current| current.min(next)));
        }
        Ok(start.unwrap_or(0))
    }

    /// 执行一次分段回放。
    ///
    /// 一致性错误只让对应池子退出本次回放并记录在汇总中；
    /// 存储错误在当前区块段结束后返回给调用方，失败池子的快照区块不会前移。
    pub async fn replay(&self, request: ReplayRequest) -> Result<ReplaySummary, SyncError> {
        let kind = request.kind;
        let start_block = self.resolve_start_block(&request).await?;
        let end_block = match request.end_block {
            Some(block) => block,
            None => match self.source.latest_block(kind).await? {
                Some(block) => block,
                None => {
                    tracing::info!("{} 事件源为空，无需回放", kind);
                    return Ok(ReplaySummary::empty(kind, start_block, start_block));
                }
            },
        };

        let mut summary = ReplaySummary::empty(kind, start_block, end_block);
        if start_block > end_block {
            tracing::info!(
                "{} 快照已是最新: start={}, end={}",
                kind,
                start_block,
                end_block
            );
            return Ok(summary);
        }

        let chunk_size = self.config.block_chunk_size.max(1);
        tracing::info!(
            "开始回放 {}: start={}, end={}, chunk={}, force_rebuild={}",
            kind,
            start_block,
            end_block,
            chunk_size,
            request.force_rebuild
        );

        let mut cursors: HashMap<PoolId, PoolCursor> = HashMap::new();
        let mut failed: BTreeSet<PoolId> = BTreeSet::new();
        let mut updated: BTreeSet<PoolId> = BTreeSet::new();

        let mut chunk_start = start_block;
        loop {
            let chunk_last = chunk_start.saturating_add(chunk_size - 1).min(end_block);
            self.replay_chunk(
                kind,
                chunk_start,
                chunk_last,
                request.force_rebuild,
                &mut cursors,
                &mut failed,
                &mut updated,
                &mut summary,
            )
            .await?;
            summary.chunks += 1;

            if chunk_last >= end_block {
                break;
            }
            chunk_start = chunk_last + 1;
        }

        summary.pools_updated = updated.len();
        tracing::info!(
            "{} 回放完成: 区块 {}-{}, 分段 {}, 事件 {} (跳过 {}), 更新池子 {}, 快照 {}, 失败池子 {}",
            kind,
            summary.start_block,
            summary.end_block,
            summary.chunks,
            summary.events_applied,
            summary.events_skipped,
            summary.pools_updated,
            summary.snapshots_persisted,
            summary.failed_pools.len()
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn replay_chunk(
        &self,
        kind: PoolKind,
        chunk_start: u64,
        snapshot_block: u64,
        force_rebuild: bool,
        cursors: &mut HashMap<PoolId, PoolCursor>,
        failed: &mut BTreeSet<PoolId>,
        updated: &mut BTreeSet<PoolId>,
        summary: &mut ReplaySummary,
    ) -> Result<(), SyncError> {
        let logs = self
            .source
            .load_range(kind, chunk_start, snapshot_block)
            .await?;
        let batch = decode_batch(kind, &logs);
        summary.raw_logs += logs.len();
        summary.events_decoded += batch.events.len();
        summary.decode_failures += batch.failures();

        if let Some(sink) = &self.event_log {
            match sink.append_batch(&batch.events).await {
                Ok(count) => summary.events_logged += count,
                Err(err) => tracing::warn!(
                    "事件日志写入失败: 区块 {}-{}, 错误: {}",
                    chunk_start,
                    snapshot_block,
                    err
                ),
            }
        }

        let tracked = self
            .registry
            .tracked_pools_with_events(kind, &batch.events)
            .await;
        let mut grouped: BTreeMap<PoolId, Vec<LiquidityEvent>> = BTreeMap::new();
        let mut unknown: BTreeMap<PoolId, usize> = BTreeMap::new();
        for event in batch.events {
            if !tracked.contains(&event.pool_id) {
                *unknown.entry(event.pool_id).or_default() += 1;
                continue;
            }
            if failed.contains(&event.pool_id) {
                continue;
            }
            grouped.entry(event.pool_id).or_default().push(event);
        }
        for (pool, count) in &unknown {
            tracing::warn!("忽略未注册池子的事件: pool={}, 数量={}", pool, count);
            summary.unknown_pool_events += count;
        }

        tracing::info!(
            "处理区块段 {}-{}: 日志 {}, 池子 {}",
            chunk_start,
            snapshot_block,
            logs.len(),
            grouped.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (pool_id, events) in grouped {
            let cursor = cursors.remove(&pool_id);
            let pool = match cursor.as_ref().map(|cursor| cursor.pool.clone()) {
                Some(pool) => pool,
                None => match self.registry.lookup(&pool_id).await {
                    Some(pool) => pool,
                    None => continue,
                },
            };
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|err| {
                        PoolChunkError::Store(pool.id, StoreError::Backend(err.to_string()))
                    })?;
                replay_pool_chunk(store, pool, cursor, events, snapshot_block, force_rebuild).await
            });
        }

        let mut store_error: Option<SyncError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    store_error.get_or_insert(SyncError::Task(err.to_string()));
                    continue;
                }
            };
            match result {
                Ok(outcome) => {
                    summary.events_applied += outcome.applied;
                    summary.events_skipped += outcome.skipped;
                    let pool_id = outcome.cursor.pool.id;
                    if outcome.persisted {
                        summary.snapshots_persisted += 1;
                        updated.insert(pool_id);
                    }
                    cursors.insert(pool_id, outcome.cursor);
                }
                Err(PoolChunkError::Consistency(failure)) => {
                    tracing::error!(
                        pool = %failure.pool_id,
                        block = ?failure.block_number,
                        tx = ?failure.transaction_hash,
                        "池子回放失败，需要 force_rebuild 恢复: {}",
                        failure.error
                    );
                    failed.insert(failure.pool_id);
                    summary.failed_pools.push(failure);
                }
                Err(PoolChunkError::Store(pool, err)) => {
                    tracing::error!("快照保存失败: pool={}, 错误: {}", pool, err);
                    store_error.get_or_insert(SyncError::Store { pool, source: err });
                }
            }
        }

        match store_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn replay_pool_chunk(
    store: Arc<dyn SnapshotStore>,
    pool: Pool,
    cursor: Option<PoolCursor>,
    mut events: Vec<LiquidityEvent>,
    snapshot_block: u64,
    force_rebuild: bool,
) -> Result<PoolChunkOutcome, PoolChunkError> {
    let mut cursor = match cursor {
        Some(cursor) => cursor,
        None => load_cursor(store.as_ref(), pool, force_rebuild).await?,
    };

    sort_events(&mut events);
    let before = events.len();
    if let Some(persisted) = cursor.persisted_block {
        events.retain(|event| event.block_number > persisted);
    }
    let skipped = before - events.len();
    if events.is_empty() {
        return Ok(PoolChunkOutcome {
            cursor,
            applied: 0,
            skipped,
            persisted: false,
        });
    }

    for event in &events {
        if let Err(err) = apply_liquidity_update(&mut cursor.state, &LiquidityUpdate::from(event)) {
            return Err(PoolChunkError::Consistency(PoolFailure {
                pool_id: cursor.pool.id,
                error: err.to_string(),
                kind: Some(err),
                block_number: Some(event.block_number),
                transaction_hash: Some(event.transaction_hash),
            }));
        }
    }

    let snapshot =
        PoolSnapshot::from_state(&cursor.pool, &cursor.state, snapshot_block, snapshot_block);
    let saved = store
        .save(snapshot)
        .await
        .map_err(|err| PoolChunkError::Store(cursor.pool.id, err))?;
    tracing::debug!(
        pool = %saved.pool_id,
        block = saved.snapshot_block,
        ticks = saved.total_ticks,
        words = saved.total_bitmap_words,
        update_count = saved.update_count,
        "快照已提交"
    );
    cursor.persisted_block = Some(snapshot_block);

    Ok(PoolChunkOutcome {
        cursor,
        applied: events.len(),
        skipped,
        persisted: true,
    })
}

async fn load_cursor(
    store: &dyn SnapshotStore,
    pool: Pool,
    force_rebuild: bool,
) -> Result<PoolCursor, PoolChunkError> {
    if force_rebuild {
        return Ok(PoolCursor {
            state: TickStateStore::new(pool.tick_spacing),
            pool,
            persisted_block: None,
        });
    }
    let snapshot = store
        .load(&pool.id)
        .await
        .map_err(|err| PoolChunkError::Store(pool.id, err))?;
    match snapshot {
        Some(snapshot) => match snapshot.to_state() {
            Ok(state) => Ok(PoolCursor {
                pool,
                state,
                persisted_block: Some(snapshot.snapshot_block),
            }),
            Err(err) => Err(PoolChunkError::Consistency(PoolFailure {
                pool_id: pool.id,
                error: format!("快照完整性校验失败: {}", err),
                kind: Some(err),
                block_number: Some(snapshot.snapshot_block),
                transaction_hash: None,
            })),
        },
        None => Ok(PoolCursor {
            state: TickStateStore::new(pool.tick_spacing),
            pool,
            persisted_block: None,
        }),
    }
}
