//! 逾期订单发布
//!
//! `PastDueTrigger` 周期性地为每个发送时间策略请求工作，重复请求由合并信号吸收；
//! `PastDueOrdersPublisher` 为每个策略运行一个 worker：等待信号 → 认领 → 批量发布 → 标记完成。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use notify_shared::config::WorkerConfig;
use notify_shared::error::NotifyError;
use notify_shared::events::{NotificationOrder, SendingTimePolicy};
use notify_shared::kafka::ReliableProducer;
use notify_shared::retry::{RetryPolicy, retry_with_policy};
use notify_shared::signal::PolicyPartitionedSignal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::OrderWorkerError;
use crate::repository::PastDueOrderRepository;

/// 退回订单的重试次数（不含首次）与间隔
const RELEASE_RETRIES: u32 = 3;
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// 按策略分区的调度信号
pub type PolicySignal = PolicyPartitionedSignal<SendingTimePolicy>;

// ---------------------------------------------------------------------------
// 发送时间窗口
// ---------------------------------------------------------------------------

/// 策略当前是否允许发送
///
/// Anytime 总是允许；Daytime 只在 `[daytime_start_hour, daytime_end_hour)`（UTC）内允许。
pub fn is_send_window_open(
    policy: SendingTimePolicy,
    now: DateTime<Utc>,
    config: &WorkerConfig,
) -> bool {
    match policy {
        SendingTimePolicy::Anytime => true,
        SendingTimePolicy::Daytime => {
            let hour = now.hour();
            hour >= config.daytime_start_hour && hour < config.daytime_end_hour
        }
    }
}

// ---------------------------------------------------------------------------
// PastDueTrigger
// ---------------------------------------------------------------------------

/// 周期触发器
pub struct PastDueTrigger {
    signal: Arc<PolicySignal>,
    config: WorkerConfig,
}

impl PastDueTrigger {
    pub fn new(signal: Arc<PolicySignal>, config: WorkerConfig) -> Self {
        Self { signal, config }
    }

    /// 对当前窗口内的每个策略尝试入队，返回被接受的策略
    pub fn fire(&self, now: DateTime<Utc>) -> Vec<SendingTimePolicy> {
        let mut accepted = Vec::new();
        for policy in SendingTimePolicy::ALL {
            if !is_send_window_open(policy, now, &self.config) {
                continue;
            }
            match self.signal.try_enqueue(&policy) {
                Ok(true) => accepted.push(policy),
                Ok(false) => debug!(policy = %policy, "上一轮仍在执行，本次触发被合并"),
                Err(e) => warn!(policy = %policy, error = %e, "触发失败"),
            }
        }
        accepted
    }

    /// 按配置间隔触发直到取消
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.trigger_interval_secs.max(1)));
        info!(
            interval_secs = self.config.trigger_interval_secs,
            "逾期订单触发器已启动"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.fire(Utc::now());
                }
            }
        }

        info!("逾期订单触发器已停止");
    }
}

// ---------------------------------------------------------------------------
// PastDueOrdersPublisher
// ---------------------------------------------------------------------------

/// 一轮发布的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishRound {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

/// 逾期订单发布 worker
pub struct PastDueOrdersPublisher {
    repository: Arc<dyn PastDueOrderRepository>,
    producer: ReliableProducer,
    signal: Arc<PolicySignal>,
    topic: String,
    batch_size: i64,
}

impl PastDueOrdersPublisher {
    pub fn new(
        repository: Arc<dyn PastDueOrderRepository>,
        producer: ReliableProducer,
        signal: Arc<PolicySignal>,
        topic: impl Into<String>,
        batch_size: i64,
    ) -> Self {
        Self {
            repository,
            producer,
            signal,
            topic: topic.into(),
            batch_size,
        }
    }

    /// 指定策略的 worker 循环，直到取消
    ///
    /// 每轮结束（无论成败）都释放信号，保证后续触发能再次入队。
    pub async fn run(
        &self,
        policy: SendingTimePolicy,
        cancel: CancellationToken,
    ) -> Result<(), OrderWorkerError> {
        info!(policy = %policy, topic = %self.topic, "逾期订单发布 worker 已启动");

        loop {
            match self.signal.wait(&policy, &cancel).await {
                Ok(()) => {}
                Err(NotifyError::Cancelled) => break,
                Err(e) => return Err(e.into()),
            }

            let outcome = self.drain(policy, &cancel).await;
            self.signal.mark_completed(&policy)?;

            match outcome {
                Ok(round) if round.claimed > 0 => info!(
                    policy = %policy,
                    claimed = round.claimed,
                    published = round.published,
                    failed = round.failed,
                    "逾期订单发布完成"
                ),
                Ok(_) => debug!(policy = %policy, "没有到期订单"),
                Err(e) => error!(policy = %policy, error = %e, "逾期订单发布失败"),
            }
        }

        info!(policy = %policy, "逾期订单发布 worker 已停止");
        Ok(())
    }

    /// 反复认领直到不足一批或被取消
    pub async fn drain(
        &self,
        policy: SendingTimePolicy,
        cancel: &CancellationToken,
    ) -> Result<PublishRound, OrderWorkerError> {
        let mut total = PublishRound::default();

        while !cancel.is_cancelled() {
            let round = self.publish_once(policy, cancel).await?;
            total.claimed += round.claimed;
            total.published += round.published;
            total.failed += round.failed;

            // 有失败时停止本轮，避免同一批订单被立即重新认领
            if (round.claimed as i64) < self.batch_size || round.failed > 0 {
                break;
            }
        }

        Ok(total)
    }

    /// 认领一批订单并发布
    ///
    /// 认领后出现的任何失败都会把未发布的订单退回 Registered；退回本身失败时按固定间隔重试。
    pub async fn publish_once(
        &self,
        policy: SendingTimePolicy,
        cancel: &CancellationToken,
    ) -> Result<PublishRound, OrderWorkerError> {
        let orders = self
            .repository
            .claim_past_due(policy, self.batch_size)
            .await?;
        if orders.is_empty() {
            return Ok(PublishRound::default());
        }

        let entries = match serialize_orders(&orders) {
            Ok(entries) => entries,
            Err(e) => {
                error!(policy = %policy, error = %e, "订单序列化失败，整批退回");
                let ids: Vec<Uuid> = orders.iter().map(|order| order.id).collect();
                self.release_with_retry(&ids).await?;
                return Err(e.into());
            }
        };

        let failed = self
            .producer
            .publish_keyed_batch(&self.topic, &entries, cancel)
            .await;

        let failed_ids: Vec<Uuid> = failed.iter().map(|&idx| orders[idx].id).collect();
        if !failed_ids.is_empty() {
            for id in &failed_ids {
                warn!(order_id = %id, policy = %policy, "订单发布失败，退回待认领");
            }
            self.release_with_retry(&failed_ids).await?;
        }

        Ok(PublishRound {
            claimed: orders.len(),
            published: orders.len() - failed_ids.len(),
            failed: failed_ids.len(),
        })
    }

    async fn release_with_retry(&self, order_ids: &[Uuid]) -> Result<u64, OrderWorkerError> {
        let released = retry_with_policy(
            &RetryPolicy::fixed(RELEASE_RETRIES, RELEASE_RETRY_DELAY),
            "release_orders",
            |e| !e.is_cancelled(),
            || self.repository.release(order_ids),
        )
        .await?;
        Ok(released)
    }
}

/// 以订单 id 为消息键序列化，同一订单的消息保持分区内顺序
fn serialize_orders(orders: &[NotificationOrder]) -> Result<Vec<(String, String)>, NotifyError> {
    orders
        .iter()
        .map(|order| -> Result<(String, String), NotifyError> {
            Ok((order.message_key(), serde_json::to_string(order)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockPastDueOrderRepository;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use notify_shared::events::NotificationChannel;
    use notify_shared::kafka::{BrokerTransport, PublishOutcome};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// 负载中包含指定订单 id 的消息会被拒绝
    #[derive(Default)]
    struct SelectiveTransport {
        reject: Vec<Uuid>,
        delivered: Mutex<Vec<String>>,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerTransport for SelectiveTransport {
        async fn deliver(&self, _topic: &str, key: Option<&str>, payload: &[u8]) -> PublishOutcome {
            if let Some(key) = key {
                self.keys.lock().unwrap().push(key.to_string());
            }
            let payload = String::from_utf8_lossy(payload).into_owned();
            if self.reject.iter().any(|id| payload.contains(&id.to_string())) {
                return PublishOutcome::Failed {
                    reason: "Broker: Not enough in-sync replicas".to_string(),
                    transient: true,
                };
            }
            self.delivered.lock().unwrap().push(payload);
            PublishOutcome::Delivered {
                partition: 0,
                offset: 0,
            }
        }
    }

    fn make_order(policy: SendingTimePolicy) -> NotificationOrder {
        NotificationOrder {
            id: Uuid::now_v7(),
            senders_reference: None,
            creator: "ttd".to_string(),
            requested_send_time: Utc::now(),
            notification_channel: NotificationChannel::EmailAndSms,
            recipients: vec![],
            templates: vec![],
            sending_time_policy: policy,
            created: Utc::now(),
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            trigger_interval_secs: 60,
            daytime_start_hour: 7,
            daytime_end_hour: 16,
            claim_batch_size: 2,
        }
    }

    fn signal() -> Arc<PolicySignal> {
        Arc::new(PolicyPartitionedSignal::new(SendingTimePolicy::ALL))
    }

    #[test]
    fn test_send_window() {
        let config = worker_config();
        let morning = Utc.with_ymd_and_hms(2024, 5, 1, 6, 59, 0).unwrap();
        let opening = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let closing = Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap();

        assert!(is_send_window_open(SendingTimePolicy::Anytime, morning, &config));
        assert!(!is_send_window_open(SendingTimePolicy::Daytime, morning, &config));
        assert!(is_send_window_open(SendingTimePolicy::Daytime, opening, &config));
        assert!(!is_send_window_open(SendingTimePolicy::Daytime, closing, &config));
    }

    #[test]
    fn test_trigger_coalesces_and_respects_window() {
        let signal = signal();
        let trigger = PastDueTrigger::new(signal.clone(), worker_config());
        let night = Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert_eq!(trigger.fire(night), vec![SendingTimePolicy::Anytime]);
        // Anytime 仍在排队，只有 Daytime 被接受
        assert_eq!(trigger.fire(noon), vec![SendingTimePolicy::Daytime]);
        assert!(trigger.fire(noon).is_empty());

        signal.mark_completed(&SendingTimePolicy::Anytime).unwrap();
        assert_eq!(trigger.fire(noon), vec![SendingTimePolicy::Anytime]);
    }

    #[tokio::test]
    async fn test_publish_once_releases_failed_orders() {
        let ok = make_order(SendingTimePolicy::Anytime);
        let bad = make_order(SendingTimePolicy::Anytime);
        let bad_id = bad.id;

        let mut repository = MockPastDueOrderRepository::new();
        let claimed = vec![ok.clone(), bad.clone()];
        repository
            .expect_claim_past_due()
            .withf(|policy, limit| *policy == SendingTimePolicy::Anytime && *limit == 2)
            .times(1)
            .returning(move |_, _| Ok(claimed.clone()));
        repository
            .expect_release()
            .withf(move |ids| ids.len() == 1 && ids[0] == bad_id)
            .times(1)
            .returning(|ids| Ok(ids.len() as u64));

        let transport = Arc::new(SelectiveTransport {
            reject: vec![bad_id],
            ..Default::default()
        });
        let publisher = PastDueOrdersPublisher::new(
            Arc::new(repository),
            ReliableProducer::with_transport(transport.clone()),
            signal(),
            "notify.orders.pastdue",
            2,
        );

        let round = publisher
            .publish_once(SendingTimePolicy::Anytime, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            round,
            PublishRound {
                claimed: 2,
                published: 1,
                failed: 1
            }
        );

        let delivered = transport.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let published: NotificationOrder = serde_json::from_str(&delivered[0]).unwrap();
        assert_eq!(published.id, ok.id);

        // 每条消息都以订单 id 为键
        let mut keys = transport.keys.lock().unwrap().clone();
        keys.sort();
        let mut expected = vec![ok.id.to_string(), bad_id.to_string()];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_failed_release_is_retried_then_surfaced() {
        let bad = make_order(SendingTimePolicy::Anytime);
        let bad_id = bad.id;

        let mut repository = MockPastDueOrderRepository::new();
        repository
            .expect_claim_past_due()
            .times(1)
            .returning(move |_, _| Ok(vec![bad.clone()]));
        repository
            .expect_release()
            .withf(move |ids| ids.len() == 1 && ids[0] == bad_id)
            .times(RELEASE_RETRIES as usize + 1)
            .returning(|_| Err(NotifyError::Internal("连接已断开".to_string())));

        let publisher = PastDueOrdersPublisher::new(
            Arc::new(repository),
            ReliableProducer::with_transport(Arc::new(SelectiveTransport {
                reject: vec![bad_id],
                ..Default::default()
            })),
            signal(),
            "notify.orders.pastdue",
            2,
        );

        let err = publisher
            .publish_once(SendingTimePolicy::Anytime, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrderWorkerError::Shared(NotifyError::Internal(_))));
    }

    #[tokio::test]
    async fn test_release_recovers_after_transient_failure() {
        let bad = make_order(SendingTimePolicy::Anytime);
        let bad_id = bad.id;

        let mut repository = MockPastDueOrderRepository::new();
        let mut seq = mockall::Sequence::new();
        repository
            .expect_claim_past_due()
            .returning(move |_, _| Ok(vec![bad.clone()]));
        repository
            .expect_release()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(NotifyError::Internal("连接已断开".to_string())));
        repository
            .expect_release()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ids| Ok(ids.len() as u64));

        let publisher = PastDueOrdersPublisher::new(
            Arc::new(repository),
            ReliableProducer::with_transport(Arc::new(SelectiveTransport {
                reject: vec![bad_id],
                ..Default::default()
            })),
            signal(),
            "notify.orders.pastdue",
            2,
        );

        let round = publisher
            .publish_once(SendingTimePolicy::Anytime, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(round.failed, 1);
        assert_eq!(round.published, 0);
    }

    #[test]
    fn test_serialized_orders_are_keyed_by_order_id() {
        let order = make_order(SendingTimePolicy::Daytime);
        let entries = serialize_orders(std::slice::from_ref(&order)).unwrap();
        assert_eq!(entries[0].0, order.id.to_string());
        let back: NotificationOrder = serde_json::from_str(&entries[0].1).unwrap();
        assert_eq!(back, order);
    }

    #[tokio::test]
    async fn test_drain_claims_until_short_batch() {
        let mut repository = MockPastDueOrderRepository::new();
        let mut seq = mockall::Sequence::new();
        let full = vec![
            make_order(SendingTimePolicy::Daytime),
            make_order(SendingTimePolicy::Daytime),
        ];
        let short = vec![make_order(SendingTimePolicy::Daytime)];
        repository
            .expect_claim_past_due()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(full.clone()));
        repository
            .expect_claim_past_due()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(short.clone()));
        repository.expect_release().never();

        let publisher = PastDueOrdersPublisher::new(
            Arc::new(repository),
            ReliableProducer::with_transport(Arc::new(SelectiveTransport::default())),
            signal(),
            "notify.orders.pastdue",
            2,
        );

        let total = publisher
            .drain(SendingTimePolicy::Daytime, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(total.claimed, 3);
        assert_eq!(total.published, 3);
    }

    #[tokio::test]
    async fn test_run_releases_signal_after_each_round() {
        let mut repository = MockPastDueOrderRepository::new();
        repository
            .expect_claim_past_due()
            .returning(|_, _| Ok(vec![]));

        let signal = signal();
        let publisher = Arc::new(PastDueOrdersPublisher::new(
            Arc::new(repository),
            ReliableProducer::with_transport(Arc::new(SelectiveTransport::default())),
            signal.clone(),
            "notify.orders.pastdue",
            10,
        ));
        let cancel = CancellationToken::new();

        let worker = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(SendingTimePolicy::Anytime, cancel).await })
        };

        assert!(signal.try_enqueue(&SendingTimePolicy::Anytime).unwrap());
        tokio::time::timeout(Duration::from_secs(1), async {
            while signal.is_pending(&SendingTimePolicy::Anytime).unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker 应在一轮后释放信号");

        cancel.cancel();
        worker.await.unwrap().unwrap();
    }
}
