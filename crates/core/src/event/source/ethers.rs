use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Filter, Log, ValueOrArray};
use tokio::time::{sleep, Duration};

use super::{LogSource, SourceError};
use crate::event::RawLog;
use crate::types::PoolKind;

/// 基于 `eth_getLogs` 的日志源配置。
#[derive(Debug, Clone)]
pub struct EthersLogSourceConfig {
    /// HTTP 端点地址。
    pub http_endpoint: String,
    /// V3 池子地址过滤，为空则不限制。
    pub v3_addresses: Vec<Address>,
    /// V4 PoolManager 地址，V4 事件只从该合约发出。
    pub v4_pool_manager: Option<Address>,
    /// 单次请求的最大区块跨度。
    pub chunk_size: u64,
    /// 请求失败后的等待时长。
    pub retry_interval: Duration,
    /// 单个区块段的最大重试次数。
    pub max_retries: u32,
}

impl Default for EthersLogSourceConfig {
    fn default() -> Self {
        Self {
            http_endpoint: String::new(),
            v3_addresses: Vec::new(),
            v4_pool_manager: None,
            chunk_size: 2_000,
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// ethers-rs HTTP 日志源，按区块段分批调用 `eth_getLogs`。
#[derive(Debug, Clone)]
pub struct EthersLogSource<M: Middleware> {
    provider: Arc<M>,
    config: EthersLogSourceConfig,
}

impl EthersLogSource<Provider<Http>> {
    pub fn connect(config: EthersLogSourceConfig) -> Result<Self, SourceError> {
        let provider = Provider::<Http>::try_from(config.http_endpoint.as_str())
            .map_err(|err| SourceError::Network(err.to_string()))?;
        Ok(Self::new(Arc::new(provider), config))
    }
}

impl<M: Middleware> EthersLogSource<M> {
    pub fn new(provider: Arc<M>, config: EthersLogSourceConfig) -> Self {
        Self { provider, config }
    }

    fn base_filter(&self, kind: PoolKind) -> Filter {
        let mut filter = Filter::new().topic0(ValueOrArray::Array(kind.event_topics().to_vec()));
        match kind {
            PoolKind::V3 if !self.config.v3_addresses.is_empty() => {
                filter = filter.address(ValueOrArray::Array(self.config.v3_addresses.clone()));
            }
            PoolKind::V4 => {
                if let Some(manager) = self.config.v4_pool_manager {
                    filter = filter.address(manager);
                }
            }
            _ => {}
        }
        filter
    }

    async fn fetch_span(
        &self,
        filter: &Filter,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, SourceError> {
        let filter = span_filter(filter, from, to);
        let mut attempt = 0;
        loop {
            match self.provider.get_logs(&filter).await {
                Ok(logs) => return Ok(logs),
                Err(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "日志请求失败: from={}, to={}, 第 {} 次重试, 错误: {}",
                        from,
                        to,
                        attempt,
                        err
                    );
                    sleep(self.config.retry_interval).await;
                }
                Err(err) => return Err(SourceError::Network(err.to_string())),
            }
        }
    }
}

fn span_filter(filter: &Filter, from: u64, to: u64) -> Filter {
    filter
        .clone()
        .from_block(BlockNumber::Number(from.into()))
        .to_block(BlockNumber::Number(to.into()))
}

fn to_raw_log(log: Log) -> Result<RawLog, SourceError> {
    Ok(RawLog {
        address: log.address,
        topics: log.topics,
        data: log.data,
        block_number: log
            .block_number
            .ok_or(SourceError::MissingField("block_number"))?
            .as_u64(),
        transaction_index: log
            .transaction_index
            .ok_or(SourceError::MissingField("transaction_index"))?
            .as_u64(),
        log_index: log
            .log_index
            .ok_or(SourceError::MissingField("log_index"))?
            .as_u64(),
        transaction_hash: log
            .transaction_hash
            .ok_or(SourceError::MissingField("transaction_hash"))?,
        block_timestamp: None,
    })
}

#[async_trait]
impl<M> LogSource for EthersLogSource<M>
where
    M: Middleware + 'static,
{
    async fn load_range(
        &self,
        kind: PoolKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SourceError> {
        let filter = self.base_filter(kind);
        let chunk = self.config.chunk_size.max(1);
        let mut rows = Vec::new();
        let mut current = from_block;
        while current <= to_block {
            let end = current.saturating_add(chunk - 1).min(to_block);
            let logs = self.fetch_span(&filter, current, end).await?;
            tracing::debug!("拉取日志: from={}, to={}, 数量={}", current, end, logs.len());
            for log in logs {
                if log.removed.unwrap_or(false) {
                    continue;
                }
                rows.push(to_raw_log(log)?);
            }
            if end == u64::MAX {
                break;
            }
            current = end + 1;
        }
        Ok(rows)
    }

    async fn latest_block(&self, _kind: PoolKind) -> Result<Option<u64>, SourceError> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|err| SourceError::Network(err.to_string()))?;
        Ok(Some(number.as_u64()))
    }
}
