use anyhow::Result;
use serde_json::json;

use liquidity_snapshot_core::config::AppConfig;
use liquidity_snapshot_core::types::PoolId;

use super::utils::snapshot_store;

/// 打印池子快照，读取时做完整性校验。
pub async fn dump_snapshot(config: &AppConfig, pool: PoolId, summary_only: bool) -> Result<()> {
    let store = snapshot_store(config);
    let snapshot = match store.load(&pool).await? {
        Some(snapshot) => snapshot,
        None => {
            log::warn!("未找到池子快照: {}", pool);
            return Ok(());
        }
    };
    if let Err(err) = snapshot.to_state() {
        log::error!("快照完整性校验失败: pool={}, 错误: {}", pool, err);
    }

    if summary_only {
        let summary = json!({
            "pool_id": snapshot.pool_id,
            "protocol": snapshot.pool.protocol,
            "snapshot_block": snapshot.snapshot_block,
            "last_event_block": snapshot.last_event_block,
            "total_ticks": snapshot.total_ticks,
            "total_bitmap_words": snapshot.total_bitmap_words,
            "update_count": snapshot.update_count,
        });
        log::info!("快照汇总: {}", serde_json::to_string_pretty(&summary)?);
    } else {
        log::info!("快照内容: {}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

/// 打印快照存储统计。
pub async fn stats(config: &AppConfig) -> Result<()> {
    let stats = snapshot_store(config).statistics().await?;
    log::info!("快照统计: {}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
