//! 逾期订单消费者
//!
//! 状态机：Created → Subscribed → Running → Stopping → Stopped。
//! `start` 订阅 topic 并派生唯一的消费循环后立即返回；`stop` 取消循环、等待其退出并退订。
//! 单个循环顺序处理消息，同一分区内的订单不会被并发处理。

use std::sync::Arc;
use std::time::Duration;

use notify_shared::events::NotificationOrder;
use notify_shared::kafka::{ConsumerMessage, MessageSource};
use notify_shared::observability::metrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::OrderWorkerError;
use crate::processor::OrderProcessor;

/// 拉取出错后的退避，避免 broker 不可用时空转
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// 消费者生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Subscribed,
    Running,
    Stopping,
    Stopped,
}

/// 逾期订单消费者
pub struct OrderConsumer {
    source: Arc<dyn MessageSource>,
    processor: Arc<dyn OrderProcessor>,
    topic: String,
    state: ConsumerState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl OrderConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        processor: Arc<dyn OrderProcessor>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            source,
            processor,
            topic: topic.into(),
            state: ConsumerState::Created,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// 订阅并启动后台消费循环，不阻塞调用方
    pub fn start(&mut self) -> Result<(), OrderWorkerError> {
        if self.state != ConsumerState::Created {
            return Err(OrderWorkerError::InvalidState {
                expected: ConsumerState::Created,
                actual: self.state,
            });
        }

        self.source.subscribe(&[self.topic.as_str()])?;
        self.state = ConsumerState::Subscribed;

        let source = self.source.clone();
        let processor = self.processor.clone();
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            consume_loop(source, processor, cancel).await;
        }));
        self.state = ConsumerState::Running;

        info!(topic = %self.topic, "逾期订单消费者已启动");
        Ok(())
    }

    /// 停止消费循环并释放订阅
    ///
    /// 正在处理的消息会先处理完，之后不再拉取新消息。未启动的消费者直接进入 Stopped；
    /// 重复调用是空操作。
    pub async fn stop(&mut self) {
        if self.state == ConsumerState::Stopped {
            return;
        }

        self.state = ConsumerState::Stopping;
        self.cancel.cancel();

        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "消费循环异常退出");
        }

        self.source.unsubscribe();
        self.state = ConsumerState::Stopped;
        info!(topic = %self.topic, "逾期订单消费者已停止");
    }
}

/// 消费循环，直到取消
async fn consume_loop(
    source: Arc<dyn MessageSource>,
    processor: Arc<dyn OrderProcessor>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            received = source.recv() => received,
        };

        let msg = match received {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "拉取消息失败，稍后重试");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => continue,
                }
            }
        };

        if let Err(e) = handle_message(processor.as_ref(), &msg).await {
            error!(
                error = %e,
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "处理逾期订单失败"
            );
        }

        // 无论成功与否都推进 offset，坏消息不会阻塞分区
        if let Err(e) = source.commit_processed(&msg) {
            warn!(error = %e, offset = msg.offset, "存储 offset 失败，重启后可能重复投递");
        }
    }

    debug!("消费循环已退出");
}

/// 处理单条消息：反序列化后交给订单处理协作方
pub async fn handle_message(
    processor: &dyn OrderProcessor,
    msg: &ConsumerMessage,
) -> Result<(), OrderWorkerError> {
    let order: NotificationOrder = match msg.deserialize_payload() {
        Ok(order) => order,
        Err(e) => {
            metrics::record_order_consumed("unparseable");
            return Err(e.into());
        }
    };

    debug!(order_id = %order.id, offset = msg.offset, "收到逾期订单");

    match processor.process_order(&order).await {
        Ok(()) => {
            metrics::record_order_consumed("processed");
            Ok(())
        }
        Err(e) => {
            metrics::record_order_consumed("failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::MockOrderProcessor;
    use async_trait::async_trait;
    use chrono::Utc;
    use notify_shared::error::{NotifyError, Result as SharedResult};
    use notify_shared::events::{NotificationChannel, SendingTimePolicy};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{Mutex, mpsc};
    use uuid::Uuid;

    /// 由测试通过 channel 喂消息的来源
    struct ChannelSource {
        rx: Mutex<mpsc::Receiver<ConsumerMessage>>,
        committed: StdMutex<Vec<i64>>,
        subscribed: StdMutex<Vec<String>>,
        unsubscribed: StdMutex<bool>,
    }

    impl ChannelSource {
        fn new() -> (Arc<Self>, mpsc::Sender<ConsumerMessage>) {
            let (tx, rx) = mpsc::channel(16);
            let source = Arc::new(Self {
                rx: Mutex::new(rx),
                committed: StdMutex::new(Vec::new()),
                subscribed: StdMutex::new(Vec::new()),
                unsubscribed: StdMutex::new(false),
            });
            (source, tx)
        }
    }

    #[async_trait]
    impl MessageSource for ChannelSource {
        fn subscribe(&self, topics: &[&str]) -> SharedResult<()> {
            let mut subscribed = self.subscribed.lock().unwrap();
            subscribed.extend(topics.iter().map(|t| t.to_string()));
            Ok(())
        }

        async fn recv(&self) -> SharedResult<ConsumerMessage> {
            let mut rx = self.rx.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| NotifyError::Kafka("来源已关闭".to_string()))
        }

        fn commit_processed(&self, msg: &ConsumerMessage) -> SharedResult<()> {
            self.committed.lock().unwrap().push(msg.offset);
            Ok(())
        }

        fn unsubscribe(&self) {
            *self.unsubscribed.lock().unwrap() = true;
        }
    }

    fn order_json(id: Uuid) -> Vec<u8> {
        let order = NotificationOrder {
            id,
            senders_reference: None,
            creator: "ttd".to_string(),
            requested_send_time: Utc::now(),
            notification_channel: NotificationChannel::Email,
            recipients: vec![],
            templates: vec![],
            sending_time_policy: SendingTimePolicy::Anytime,
            created: Utc::now(),
        };
        serde_json::to_vec(&order).unwrap()
    }

    fn message(offset: i64, payload: Vec<u8>) -> ConsumerMessage {
        ConsumerMessage {
            topic: "notify.orders.pastdue".to_string(),
            partition: 0,
            offset,
            key: None,
            payload,
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    async fn wait_for_commits(source: &ChannelSource, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.committed.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待 offset 提交超时");
    }

    #[tokio::test]
    async fn test_handle_message_invokes_processor() {
        let id = Uuid::now_v7();
        let mut processor = MockOrderProcessor::new();
        processor
            .expect_process_order()
            .withf(move |order| order.id == id)
            .times(1)
            .returning(|_| Ok(()));

        handle_message(&processor, &message(1, order_json(id)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handle_message_rejects_invalid_payload() {
        let mut processor = MockOrderProcessor::new();
        processor.expect_process_order().never();

        let err = handle_message(&processor, &message(1, b"{not json".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrderWorkerError::Shared(NotifyError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_loop_survives_bad_messages_and_processor_errors() {
        let (source, tx) = ChannelSource::new();
        let good = Uuid::now_v7();
        let failing = Uuid::now_v7();

        let mut processor = MockOrderProcessor::new();
        processor
            .expect_process_order()
            .withf(move |order| order.id == failing)
            .times(1)
            .returning(|order| {
                Err(OrderWorkerError::Processing {
                    order_id: order.id,
                    reason: "下游不可用".to_string(),
                })
            });
        processor
            .expect_process_order()
            .withf(move |order| order.id == good)
            .times(1)
            .returning(|_| Ok(()));

        let mut consumer =
            OrderConsumer::new(source.clone(), Arc::new(processor), "notify.orders.pastdue");
        consumer.start().unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(
            *source.subscribed.lock().unwrap(),
            vec!["notify.orders.pastdue".to_string()]
        );

        tx.send(message(1, b"garbage".to_vec())).await.unwrap();
        tx.send(message(2, order_json(failing))).await.unwrap();
        tx.send(message(3, order_json(good))).await.unwrap();

        wait_for_commits(&source, 3).await;
        assert_eq!(*source.committed.lock().unwrap(), vec![1, 2, 3]);

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(*source.unsubscribed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_stop_interrupts_idle_consume() {
        let (source, _tx) = ChannelSource::new();
        let mut consumer = OrderConsumer::new(
            source.clone(),
            Arc::new(MockOrderProcessor::new()),
            "notify.orders.pastdue",
        );
        consumer.start().unwrap();

        tokio::time::timeout(Duration::from_secs(1), consumer.stop())
            .await
            .expect("空闲的消费循环应能被取消");
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(source.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (source, _tx) = ChannelSource::new();
        let mut consumer = OrderConsumer::new(
            source,
            Arc::new(MockOrderProcessor::new()),
            "notify.orders.pastdue",
        );
        consumer.start().unwrap();

        let err = consumer.start().unwrap_err();
        assert!(matches!(
            err,
            OrderWorkerError::InvalidState {
                expected: ConsumerState::Created,
                actual: ConsumerState::Running,
            }
        ));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (source, _tx) = ChannelSource::new();
        let mut consumer = OrderConsumer::new(
            source.clone(),
            Arc::new(MockOrderProcessor::new()),
            "notify.orders.pastdue",
        );
        consumer.stop().await;
        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}
