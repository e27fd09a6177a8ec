//! 死信回执回放批处理
//!
//! 读取重试耗尽的死信回执，跳过已在下游达成终态的通知，
//! 把其余回执重新以 Event Grid 事件投递给状态回执入口。

pub mod error;
pub mod event_grid;
pub mod replayer;
pub mod report;
pub mod repository;
