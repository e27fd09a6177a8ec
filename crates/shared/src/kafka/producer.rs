//! 可靠生产者
//!
//! broker 异常在边界处被转换为 [`PublishOutcome`]，`ReliableProducer` 对外只暴露
//! 布尔结果或失败消息集合。瞬时错误的重试由 librdkafka 在幂等模式下完成，
//! 重试耗尽或永久错误记录日志后返回 `false`。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClientRole, client_config};
use super::admin::{RdKafkaAdmin, ensure_topics};
use crate::config::KafkaConfig;
use crate::error::{NotifyError, Result};
use crate::observability::metrics;
use crate::retry::RetryPolicy;

/// 单条发布的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// broker 已在确认法定副本上持久化
    Delivered { partition: i32, offset: i64 },
    Failed { reason: String, transient: bool },
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// broker 传输层
///
/// 实现方负责把底层客户端的错误转换为 `PublishOutcome::Failed`，不得 panic。
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn deliver(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> PublishOutcome;
}

// ---------------------------------------------------------------------------
// RdKafkaTransport
// ---------------------------------------------------------------------------

/// 基于 `FutureProducer` 的传输实现
#[derive(Clone)]
pub struct RdKafkaTransport {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl RdKafkaTransport {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = client_config(config, ClientRole::Producer)
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            secured = config.security().is_secured(),
            max_retries = config.producer_max_retries,
            "Kafka 生产者已初始化"
        );
        Ok(Self {
            producer,
            queue_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl BrokerTransport for RdKafkaTransport {
    async fn deliver(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> PublishOutcome {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, self.queue_timeout).await {
            Ok(delivery) => PublishOutcome::Delivered {
                partition: delivery.partition,
                offset: delivery.offset,
            },
            Err((e, _)) => PublishOutcome::Failed {
                transient: is_transient(&e),
                reason: e.to_string(),
            },
        }
    }
}

/// 是否为瞬时 broker 错误（重试耗尽后仍可能在稍后成功）
fn is_transient(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
        )
    )
}

// ---------------------------------------------------------------------------
// ReliableProducer
// ---------------------------------------------------------------------------

/// 面向业务的可靠生产者
///
/// 内部持有 `Arc`，可廉价克隆；但每个组件应持有自己的实例，不跨组件共享 broker 句柄。
#[derive(Clone)]
pub struct ReliableProducer {
    transport: Arc<dyn BrokerTransport>,
}

impl ReliableProducer {
    /// 连接 broker：先补齐缺失的 topic，再创建幂等生产者
    ///
    /// topic 创建失败是致命错误，直接向上返回以中止启动。
    pub async fn connect(config: &KafkaConfig) -> Result<Self> {
        let admin = RdKafkaAdmin::new(config)?;
        ensure_topics(&admin, config, &RetryPolicy::default()).await?;

        let transport = RdKafkaTransport::new(config)?;
        Ok(Self::with_transport(Arc::new(transport)))
    }

    pub fn with_transport(transport: Arc<dyn BrokerTransport>) -> Self {
        Self { transport }
    }

    /// 发布一条消息，仅当 broker 确认持久化时返回 `true`
    pub async fn publish(&self, topic: &str, message: &str) -> bool {
        self.publish_keyed(topic, None, message.as_bytes()).await
    }

    /// 带消息键发布，同一键的消息落在同一分区以保持顺序
    pub async fn publish_keyed(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> bool {
        match self.transport.deliver(topic, key, payload).await {
            PublishOutcome::Delivered { partition, offset } => {
                debug!(topic, key, partition, offset, "消息已发送");
                metrics::record_publish(topic, true);
                true
            }
            PublishOutcome::Failed { reason, transient } => {
                // 无键消息以负载本身作为标识
                let message = key
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned());
                error!(topic, message = %message, transient, error = %reason, "发送消息失败");
                metrics::record_publish(topic, false);
                false
            }
        }
    }

    /// 批量发布
    ///
    /// 空白消息不经过 broker 直接计入失败；其余消息各自独立发布，互不阻塞。
    /// 返回值按输入顺序列出无效或被 broker 拒绝的消息。取消后不再等待剩余结果，
    /// 尚未得到确认的消息同样计入失败（已确认的发布不会被撤回）。
    pub async fn publish_batch(
        &self,
        topic: &str,
        messages: &[String],
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let entries: Vec<(Option<&str>, &str)> =
            messages.iter().map(|m| (None, m.as_str())).collect();

        self.deliver_all(topic, &entries, cancel)
            .await
            .into_iter()
            .map(|idx| messages[idx].clone())
            .collect()
    }

    /// 带消息键的批量发布，返回失败条目的下标（按输入顺序）
    ///
    /// 失败判定与取消语义同 [`Self::publish_batch`]。
    pub async fn publish_keyed_batch(
        &self,
        topic: &str,
        entries: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Vec<usize> {
        let entries: Vec<(Option<&str>, &str)> = entries
            .iter()
            .map(|(key, payload)| (Some(key.as_str()), payload.as_str()))
            .collect();

        self.deliver_all(topic, &entries, cancel).await
    }

    async fn deliver_all(
        &self,
        topic: &str,
        entries: &[(Option<&str>, &str)],
        cancel: &CancellationToken,
    ) -> Vec<usize> {
        let mut failed = vec![false; entries.len()];
        let mut settled = vec![false; entries.len()];

        let mut pending = FuturesUnordered::new();
        for (idx, &(key, payload)) in entries.iter().enumerate() {
            if payload.trim().is_empty() {
                failed[idx] = true;
                settled[idx] = true;
                continue;
            }
            pending.push(async move { (idx, self.publish_keyed(topic, key, payload.as_bytes()).await) });
        }

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    warn!(topic, remaining = pending.len(), "批量发布已取消，未确认的消息计入失败");
                    break;
                }

                next = pending.next() => {
                    let Some((idx, delivered)) = next else {
                        break;
                    };
                    settled[idx] = true;
                    failed[idx] = !delivered;
                }
            }
        }

        let result: Vec<usize> = (0..entries.len())
            .filter(|&idx| failed[idx] || !settled[idx])
            .collect();

        info!(
            topic,
            total = entries.len(),
            failed = result.len(),
            "批量发布完成"
        );
        result
    }
}
