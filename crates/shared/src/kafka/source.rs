//! 消费来源
//!
//! `MessageSource` 抽象出消费循环需要的四个动作：订阅、拉取、确认处理、退订。
//! offset 只在消息交给处理方之后才被存储，崩溃重启后可能重复投递（至少一次）。

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use tracing::info;

use super::{ClientRole, ConsumerMessage, client_config};
use crate::config::KafkaConfig;
use crate::error::{NotifyError, Result};

/// 消息来源
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn subscribe(&self, topics: &[&str]) -> Result<()>;

    /// 挂起直到收到下一条消息
    ///
    /// 必须是取消安全的：调用方在 `select!` 中放弃等待时不能丢失消息。
    async fn recv(&self) -> Result<ConsumerMessage>;

    /// 标记消息已交给处理方，下次提交时生效
    fn commit_processed(&self, msg: &ConsumerMessage) -> Result<()>;

    fn unsubscribe(&self);
}

/// 基于 `StreamConsumer` 的实现
pub struct RdKafkaSource {
    consumer: StreamConsumer,
}

impl RdKafkaSource {
    /// 创建消费者
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config, ClientRole::Consumer)
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for RdKafkaSource {
    fn subscribe(&self, topics: &[&str]) -> Result<()> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    async fn recv(&self) -> Result<ConsumerMessage> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| NotifyError::Kafka(format!("接收 Kafka 消息出错: {e}")))?;

        Ok(ConsumerMessage::from_borrowed(&msg))
    }

    fn commit_processed(&self, msg: &ConsumerMessage) -> Result<()> {
        self.consumer
            .store_offset(&msg.topic, msg.partition, msg.offset)
            .map_err(|e| NotifyError::Kafka(format!("存储 offset 失败: {e}")))
    }

    fn unsubscribe(&self) {
        self.consumer.unsubscribe();
        info!("已退订 Kafka topics");
    }
}
