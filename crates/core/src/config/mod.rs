use std::path::Path;

use config::{Config, ConfigError, File, FileFormat};
use ethers::types::Address;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::syncer::{ReplayConfig, DEFAULT_BLOCK_CHUNK_SIZE};
use crate::validator::DEFAULT_VALIDATION_BATCH_SIZE;

static GLOBAL_CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// 全局应用配置。
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub contracts: ContractsConfig,
}

/// 链路相关配置。
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub http_endpoint: String,
    /// 单次 `eth_getLogs` 请求的最大区块跨度。
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
}

/// 日志配置。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub config_file: Option<String>,
    #[serde(default = "default_log_directory")]
    pub directory: String,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// 每类日志保留的历史文件数量。
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

/// 运行时配置：快照路径、分段与并发策略。
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub snapshot_path: String,
    #[serde(default)]
    pub event_log_path: Option<String>,
    #[serde(default = "default_block_chunk_size")]
    pub block_chunk_size: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_validation_batch_size")]
    pub validation_batch_size: usize,
}

impl RuntimeConfig {
    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            block_chunk_size: self.block_chunk_size,
            max_concurrency: self.max_concurrency,
        }
    }
}

/// 池子注册表配置。
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub pools_file: String,
}

/// 日志来源类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Rpc,
    File,
}

/// 原始日志来源配置。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    /// `file` 来源的 JSON lines 文件路径。
    #[serde(default)]
    pub path: Option<String>,
    /// V3 池子地址过滤，为空则不限制。
    #[serde(default)]
    pub addresses: Vec<Address>,
}

/// 合约地址配置。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractsConfig {
    #[serde(default)]
    pub v4_pool_manager: Option<Address>,
    #[serde(default)]
    pub v4_state_view: Option<Address>,
}

const fn default_log_chunk_size() -> u64 {
    2_000
}

const fn default_retry_secs() -> u64 {
    5
}

fn default_log_directory() -> String {
    "logs".to_string()
}

const fn default_max_size_mb() -> u64 {
    100
}

const fn default_max_files() -> usize {
    10
}

const fn default_block_chunk_size() -> u64 {
    DEFAULT_BLOCK_CHUNK_SIZE
}

const fn default_max_concurrency() -> usize {
    8
}

const fn default_validation_batch_size() -> usize {
    DEFAULT_VALIDATION_BATCH_SIZE
}

/// 从配置文件加载应用配置，支持 YAML/JSON/TOML。
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path_ref = path.as_ref();
    let format = match path_ref.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Some(FileFormat::Yaml),
        Some("json") => Some(FileFormat::Json),
        Some("toml") | Some("conf") => Some(FileFormat::Toml),
        _ => None,
    };
    let source = match format {
        Some(format) => File::from(path_ref).format(format),
        None => File::from(path_ref),
    };

    Config::builder().add_source(source).build()?.try_deserialize()
}

/// 初始化全局配置，仅在首次调用时生效。
pub fn init_global_config(config: AppConfig) -> Result<(), AppConfigError> {
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| AppConfigError::AlreadyInitialized)
}

/// 获取全局配置引用。
pub fn get_config() -> Result<&'static AppConfig, AppConfigError> {
    GLOBAL_CONFIG.get().ok_or(AppConfigError::Uninitialized)
}

#[derive(thiserror::Error, Debug)]
pub enum AppConfigError {
    #[error("配置已初始化")]
    AlreadyInitialized,
    #[error("配置尚未初始化")]
    Uninitialized,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_yaml_config_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
network:
  chain_id: 1
  http_endpoint: "http://localhost:8545"
logging:
  level: info
runtime:
  snapshot_path: "./snapshots"
registry:
  pools_file: "./pools.yaml"
source:
  kind: file
  path: "./logs.jsonl"
contracts:
  v4_state_view: "0x7ffe42c4a5deea5b0fec41c94c136cf115597227"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.network.chain_id, 1);
        assert_eq!(config.network.log_chunk_size, 2_000);
        assert_eq!(config.runtime.block_chunk_size, 100_000);
        assert_eq!(config.runtime.validation_batch_size, 200);
        assert_eq!(config.logging.directory, "logs");
        assert_eq!(config.source.kind, SourceKind::File);
        assert!(config.contracts.v4_state_view.is_some());
        assert!(config.contracts.v4_pool_manager.is_none());
        assert_eq!(config.runtime.replay_config().max_concurrency, 8);
    }

    #[test]
    fn test_load_toml_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[network]
chain_id = 8453

[logging]
level = "debug"

[runtime]
snapshot_path = "/tmp/snapshots"
block_chunk_size = 5000

[registry]
pools_file = "pools.yaml"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.network.chain_id, 8453);
        assert_eq!(config.runtime.block_chunk_size, 5_000);
        assert_eq!(config.source.kind, SourceKind::Rpc);
    }
}
