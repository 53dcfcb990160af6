use clap::{Parser, Subcommand};
use std::path::PathBuf;

use liquidity_snapshot_core::types::{PoolId, PoolKind};

/// CLI 入口参数定义。
#[derive(Parser, Debug)]
#[command(author, version, about = "Uniswap V3/V4 流动性快照 CLI", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config/default.yaml"
    )]
    pub config: PathBuf,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 支持的子命令。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 分段回放流动性事件并更新快照
    Replay {
        /// 协议版本：v3 或 v4
        #[arg(long, value_name = "PROTOCOL")]
        protocol: PoolKind,
        #[arg(long)]
        start_block: Option<u64>,
        #[arg(long)]
        end_block: Option<u64>,
        /// 忽略已有快照，从区块 0 重建
        #[arg(long, default_value_t = false, conflicts_with = "start_block")]
        force_rebuild: bool,
    },
    /// 打印指定池子的快照
    DumpSnapshot {
        #[arg(long, value_name = "POOL_ID")]
        pool: PoolId,
        /// 只输出汇总，不输出 tick 明细
        #[arg(long, default_value_t = false)]
        summary: bool,
    },
    /// 与链上状态对账
    Validate {
        #[arg(long, value_name = "POOL_ID")]
        pool: PoolId,
        /// 校验区块，默认取快照区块
        #[arg(long)]
        block: Option<u64>,
        /// 遍历全部合法 tick 与位图字
        #[arg(long, default_value_t = false)]
        exhaustive: bool,
    },
    /// 打印快照存储统计
    Stats,
}
