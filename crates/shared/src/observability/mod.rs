//! 统一可观测性模块
//!
//! 日志与 Prometheus 指标的单一初始化入口，两个二进制共用同一套命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 统一初始化可观测性
///
/// 先初始化日志，保证指标导出器的启动日志可见；指标导出仅在配置开启时启动。
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<()> {
    tracing::init(config)?;

    if config.metrics_enabled {
        metrics::init(service_name, config.metrics_port)?;
    }

    info!(
        service = %service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        "可观测性已初始化"
    );
    Ok(())
}
