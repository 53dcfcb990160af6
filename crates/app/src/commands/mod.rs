use anyhow::Result;
use liquidity_snapshot_core::config::AppConfig;

use crate::cli::Commands;

pub mod replay;
pub mod snapshot;
pub mod utils;
pub mod validate;

/// 根据子命令执行对应逻辑。
pub async fn run(config: &AppConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Replay {
            protocol,
            start_block,
            end_block,
            force_rebuild,
        } => replay::replay(config, protocol, start_block, end_block, force_rebuild).await,
        Commands::DumpSnapshot { pool, summary } => {
            snapshot::dump_snapshot(config, pool, summary).await
        }
        Commands::Validate {
            pool,
            block,
            exhaustive,
        } => validate::validate(config, pool, block, exhaustive).await,
        Commands::Stats => snapshot::stats(config).await,
    }
}
