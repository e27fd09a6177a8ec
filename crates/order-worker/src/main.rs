//! 逾期订单 worker
//!
//! 启动顺序：配置 → 可观测性 → 数据库 → 生产者（含 topic 补齐）→ 发布 worker 与触发器 → 消费者。
//! topic 补齐失败会中止启动。

use std::sync::Arc;

use notify_shared::config::AppConfig;
use notify_shared::database::Database;
use notify_shared::events::SendingTimePolicy;
use notify_shared::kafka::{RdKafkaSource, ReliableProducer};
use notify_shared::observability;
use notify_shared::signal::PolicyPartitionedSignal;
use order_worker::consumer::OrderConsumer;
use order_worker::past_due::{PastDueOrdersPublisher, PastDueTrigger};
use order_worker::processor::LoggingOrderProcessor;
use order_worker::repository::PgPastDueOrderRepository;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("order-worker")?;
    observability::init(&config.service_name, &config.observability)?;

    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        topic = %config.kafka.past_due_orders_topic,
        "Starting order-worker..."
    );

    let db = Database::connect(&config.database).await?;
    let producer = ReliableProducer::connect(&config.kafka).await?;

    let signal = Arc::new(PolicyPartitionedSignal::new(SendingTimePolicy::ALL));
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let publisher = Arc::new(PastDueOrdersPublisher::new(
        Arc::new(PgPastDueOrderRepository::new(db.pool().clone())),
        producer,
        signal.clone(),
        config.kafka.past_due_orders_topic.clone(),
        config.worker.claim_batch_size,
    ));
    for policy in SendingTimePolicy::ALL {
        let publisher = publisher.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = publisher.run(policy, cancel).await {
                error!(policy = %policy, error = %e, "发布 worker 异常退出");
            }
        });
    }

    let trigger = PastDueTrigger::new(signal, config.worker.clone());
    {
        let cancel = cancel.clone();
        tracker.spawn(async move { trigger.run(cancel).await });
    }
    tracker.close();

    let source = Arc::new(RdKafkaSource::new(&config.kafka)?);
    let mut consumer = OrderConsumer::new(
        source,
        Arc::new(LoggingOrderProcessor),
        config.kafka.past_due_orders_topic.clone(),
    );
    consumer.start()?;

    shutdown_signal().await;

    cancel.cancel();
    consumer.stop().await;
    tracker.wait().await;
    db.close().await;

    info!("order-worker 已停止");
    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
