//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 导出器自带 HTTP 监听，`/metrics` 供 Prometheus 抓取。

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// 安装全局 recorder 并启动 HTTP 监听，必须在 tokio 运行时内调用
pub fn init(service_name: &str, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name)
        .install()?;

    describe_metrics();
    metrics::counter!("service_starts_total").increment(1);

    info!(%addr, "Prometheus 指标导出已启动");
    Ok(())
}

/// 描述会出现在 `/metrics` 的 HELP 注释中
fn describe_metrics() {
    metrics::describe_counter!("service_starts_total", "Number of process starts");
    metrics::describe_counter!(
        "kafka_publish_total",
        "Kafka publish attempts by topic and outcome"
    );
    metrics::describe_counter!(
        "orders_consumed_total",
        "Past-due orders consumed by processing outcome"
    );
    metrics::describe_counter!(
        "dead_letter_replays_total",
        "Dead delivery reports handled by the replayer, by outcome"
    );
    metrics::describe_counter!(
        "work_signal_enqueue_total",
        "Work signal enqueue attempts by key and acceptance"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次 broker 发布
#[inline]
pub fn record_publish(topic: &str, delivered: bool) {
    let status = if delivered { "delivered" } else { "failed" };
    metrics::counter!(
        "kafka_publish_total",
        "topic" => topic.to_string(),
        "status" => status
    )
    .increment(1);
}

/// 记录一条逾期订单的处理结果（processed / failed / unparseable）
#[inline]
pub fn record_order_consumed(status: &'static str) {
    metrics::counter!("orders_consumed_total", "status" => status).increment(1);
}

/// 记录一份死信报告的重放结果（posted / failed / skipped_resolved / skipped_unparseable）
#[inline]
pub fn record_replay(status: &'static str) {
    metrics::counter!("dead_letter_replays_total", "status" => status).increment(1);
}

/// 记录一次工作信号入队尝试
#[inline]
pub fn record_signal_enqueue(key: &str, accepted: bool) {
    metrics::counter!(
        "work_signal_enqueue_total",
        "key" => key.to_string(),
        "accepted" => accepted.to_string()
    )
    .increment(1);
}
