use std::sync::Arc;

use anyhow::{anyhow, Result};

use liquidity_snapshot_core::config::AppConfig;
use liquidity_snapshot_core::state::onchain::EthersLiveStateReader;
use liquidity_snapshot_core::types::PoolId;
use liquidity_snapshot_core::validator::{LiveStateValidator, ValidationError, ValidationScope};

use super::utils::{http_provider, snapshot_store};

/// 将池子快照与链上状态对账。
pub async fn validate(
    config: &AppConfig,
    pool: PoolId,
    block: Option<u64>,
    exhaustive: bool,
) -> Result<()> {
    let snapshot = snapshot_store(config)
        .load(&pool)
        .await?
        .ok_or(ValidationError::MissingSnapshot(pool))?;
    let block = block.unwrap_or(snapshot.snapshot_block);

    let reader = EthersLiveStateReader::new(http_provider(config)?, config.contracts.v4_state_view);
    let validator = LiveStateValidator::new(Arc::new(reader), config.runtime.validation_batch_size);
    let scope = if exhaustive {
        ValidationScope::Exhaustive
    } else {
        ValidationScope::SnapshotTicks
    };
    let report = validator.validate(&snapshot, block, scope).await?;

    for mismatch in &report.mismatches {
        log::warn!("不一致: {}", serde_json::to_string(mismatch)?);
    }
    log::info!(
        "校验结果: pool={}, block={}, 检查 {}, 不一致 {}, 匹配率 {:.4}%",
        report.pool_id,
        report.block,
        report.checked(),
        report.mismatches.len(),
        report.match_rate() * 100.0
    );
    if !report.is_exact() {
        return Err(anyhow!("池子 {} 与链上状态不一致", pool));
    }
    Ok(())
}
