use anyhow::Result;
use liquidity_snapshot_core::config::AppConfig;
use liquidity_snapshot_core::syncer::{ReplayRequest, SnapshotManager};
use liquidity_snapshot_core::types::PoolKind;

use super::utils::{event_log, log_source, pool_registry, snapshot_store};

/// 回放指定协议的流动性事件。
pub async fn replay(
    config: &AppConfig,
    protocol: PoolKind,
    start_block: Option<u64>,
    end_block: Option<u64>,
    force_rebuild: bool,
) -> Result<()> {
    let mut manager = SnapshotManager::new(
        log_source(config).await?,
        pool_registry(config)?,
        snapshot_store(config),
        config.runtime.replay_config(),
    );
    if let Some(sink) = event_log(config) {
        manager = manager.with_event_log(sink);
    }

    let summary = manager
        .replay(ReplayRequest {
            kind: protocol,
            start_block,
            end_block,
            force_rebuild,
        })
        .await?;

    log::info!("回放汇总: {}", serde_json::to_string_pretty(&summary)?);
    for failure in &summary.failed_pools {
        log::error!(
            "池子 {} 回放失败 (区块 {:?}, 交易 {:?}): {}",
            failure.pool_id,
            failure.block_number,
            failure.transaction_hash,
            failure.error
        );
    }
    Ok(())
}
