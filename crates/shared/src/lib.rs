//! 共享库
//!
//! 通知后台进程共用的配置、错误处理、状态枚举、工作信号、Kafka 与数据库基础设施。

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod kafka;
pub mod lifecycle;
pub mod observability;
pub mod retry;
pub mod signal;
