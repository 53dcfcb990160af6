use std::sync::Arc;

use anyhow::{anyhow, Result};
use ethers::providers::{Http, Provider};
use tokio::time::Duration;

use liquidity_snapshot_core::config::{AppConfig, SourceKind};
use liquidity_snapshot_core::event::source::{
    EthersLogSource, EthersLogSourceConfig, JsonLinesLogSource, LogSource,
};
use liquidity_snapshot_core::event::store::{EventLogSink, JsonLinesEventLog};
use liquidity_snapshot_core::registry::InMemoryPoolRegistry;
use liquidity_snapshot_core::state::snapshot::{FileSnapshotStore, SnapshotStore};

/// 按配置构建文件快照存储。
pub fn snapshot_store(config: &AppConfig) -> Arc<dyn SnapshotStore> {
    Arc::new(FileSnapshotStore::new(
        &config.runtime.snapshot_path,
        config.network.chain_id,
    ))
}

pub fn pool_registry(config: &AppConfig) -> Result<Arc<InMemoryPoolRegistry>> {
    let registry = InMemoryPoolRegistry::load_yaml(&config.registry.pools_file)?;
    Ok(Arc::new(registry))
}

pub fn event_log(config: &AppConfig) -> Option<Arc<dyn EventLogSink>> {
    config
        .runtime
        .event_log_path
        .as_ref()
        .map(|path| Arc::new(JsonLinesEventLog::new(path)) as Arc<dyn EventLogSink>)
}

pub fn http_provider(config: &AppConfig) -> Result<Arc<Provider<Http>>> {
    if config.network.http_endpoint.is_empty() {
        return Err(anyhow!("未配置 network.http_endpoint"));
    }
    let provider = Provider::<Http>::try_from(config.network.http_endpoint.as_str())?;
    Ok(Arc::new(provider))
}

/// 按 `source.kind` 构建原始日志来源。
pub async fn log_source(config: &AppConfig) -> Result<Arc<dyn LogSource>> {
    match config.source.kind {
        SourceKind::File => {
            let path = config
                .source
                .path
                .as_ref()
                .ok_or_else(|| anyhow!("source.kind=file 时必须配置 source.path"))?;
            Ok(Arc::new(JsonLinesLogSource::open(path).await?))
        }
        SourceKind::Rpc => {
            let source = EthersLogSource::new(
                http_provider(config)?,
                EthersLogSourceConfig {
                    http_endpoint: config.network.http_endpoint.clone(),
                    v3_addresses: config.source.addresses.clone(),
                    v4_pool_manager: config.contracts.v4_pool_manager,
                    chunk_size: config.network.log_chunk_size,
                    retry_interval: Duration::from_secs(config.network.retry_secs),
                    ..Default::default()
                },
            );
            Ok(Arc::new(source))
        }
    }
}
