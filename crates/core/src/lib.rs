//! Uniswap V3/V4 流动性快照引擎核心库：解码流动性事件，按区块分段增量重建
//! 每个池子的 tick 流动性与位图状态，落盘快照，并可与链上状态对账。

pub mod config;
pub mod event;
pub mod logging;
pub mod registry;
pub mod serde_utils;
pub mod state;
pub mod syncer;
pub mod types;
pub mod validator;
