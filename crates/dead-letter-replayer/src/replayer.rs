//! 死信回放
//!
//! 流程：读取区间内的回执 → 解析内嵌结果 → 跳过已成功的通知 → 状态码改名 → 逐条投递。
//! 单条回执的解析、查询或投递失败只记录日志并计数，不中断批处理；
//! 读取回执失败会直接返回错误，由调用方转换为非零退出码。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify_shared::config::ReplayConfig;
use notify_shared::events::DeliveryReportChannel;
use notify_shared::observability::metrics;
use tracing::{info, warn};

use crate::error::ReplayError;
use crate::event_grid::{EventGridEvent, EventPoster};
use crate::report::{ReplayCandidate, to_external_status};
use crate::repository::{DeadDeliveryReportRepository, TerminalStateLookup};

/// 回放范围与节奏
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySettings {
    /// 起始 ID（包含）
    pub from_id: i64,
    /// 结束 ID（不包含）
    pub to_id: i64,
    pub reason: String,
    pub channel: DeliveryReportChannel,
    pub post_delay: Duration,
}

impl From<&ReplayConfig> for ReplaySettings {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            from_id: config.from_id,
            to_id: config.to_id,
            reason: config.reason.clone(),
            channel: config.channel,
            post_delay: Duration::from_millis(config.post_delay_ms),
        }
    }
}

impl ReplaySettings {
    /// 校验区间与渠道
    ///
    /// 内嵌结果只按邮件发送结果解析，其他渠道的回执无法回放。
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.from_id >= self.to_id {
            return Err(ReplayError::InvalidSettings(format!(
                "from_id={} 必须小于 to_id={}",
                self.from_id, self.to_id
            )));
        }
        if self.channel != DeliveryReportChannel::AzureCommunicationServices {
            return Err(ReplayError::InvalidSettings(format!(
                "不支持回放 {:?} 渠道的回执",
                self.channel
            )));
        }
        Ok(())
    }
}

/// 一次回放的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub fetched: usize,
    pub skipped_unparseable: usize,
    pub skipped_resolved: usize,
    pub posted: usize,
    pub failed: usize,
}

/// 死信回放批处理
pub struct DeadLetterReplayer {
    reports: Arc<dyn DeadDeliveryReportRepository>,
    lookup: Arc<dyn TerminalStateLookup>,
    poster: Arc<dyn EventPoster>,
    settings: ReplaySettings,
}

impl DeadLetterReplayer {
    pub fn new(
        reports: Arc<dyn DeadDeliveryReportRepository>,
        lookup: Arc<dyn TerminalStateLookup>,
        poster: Arc<dyn EventPoster>,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            reports,
            lookup,
            poster,
            settings,
        }
    }

    /// 执行一次回放
    pub async fn run(&self) -> Result<ReplaySummary, ReplayError> {
        let settings = &self.settings;
        settings.validate()?;

        let reports = self
            .reports
            .get_dead_delivery_reports(
                settings.from_id,
                settings.to_id,
                &settings.reason,
                settings.channel,
            )
            .await?;

        info!(
            from_id = settings.from_id,
            to_id = settings.to_id,
            reason = %settings.reason,
            channel = ?settings.channel,
            count = reports.len(),
            "开始回放死信回执"
        );

        let mut summary = ReplaySummary {
            fetched: reports.len(),
            ..Default::default()
        };

        let mut first_post = true;
        for report in &reports {
            let candidate = match report.parse_email_result() {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(report_id = report.id, error = %e, "回执无法解析，跳过");
                    metrics::record_replay("skipped_unparseable");
                    summary.skipped_unparseable += 1;
                    continue;
                }
            };

            match self
                .lookup
                .is_notification_in_terminal_success_state(&candidate.operation_id)
                .await
            {
                Ok(true) => {
                    info!(
                        report_id = report.id,
                        operation_id = %candidate.operation_id,
                        "通知已处于成功终态，跳过"
                    );
                    metrics::record_replay("skipped_resolved");
                    summary.skipped_resolved += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        report_id = report.id,
                        operation_id = %candidate.operation_id,
                        error = %e,
                        "查询通知终态失败"
                    );
                    metrics::record_replay("failed");
                    summary.failed += 1;
                    continue;
                }
            }

            if !first_post {
                tokio::time::sleep(settings.post_delay).await;
            }
            first_post = false;

            if self.post(&candidate).await {
                summary.posted += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            fetched = summary.fetched,
            posted = summary.posted,
            skipped_resolved = summary.skipped_resolved,
            skipped_unparseable = summary.skipped_unparseable,
            failed = summary.failed,
            "死信回放完成"
        );
        Ok(summary)
    }

    /// 投递一条回执，失败只记录日志
    async fn post(&self, candidate: &ReplayCandidate) -> bool {
        let status = to_external_status(candidate.status);
        let event = EventGridEvent::delivery_report(&candidate.operation_id, status, Utc::now());

        match self.poster.post(&event).await {
            Ok(()) => {
                info!(
                    report_id = candidate.report_id,
                    operation_id = %candidate.operation_id,
                    status,
                    "回执已重新投递"
                );
                metrics::record_replay("posted");
                true
            }
            Err(e) => {
                warn!(
                    report_id = candidate.report_id,
                    notification_id = ?candidate.notification_id,
                    operation_id = %candidate.operation_id,
                    error = %e,
                    "回执投递失败"
                );
                metrics::record_replay("failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_grid::MockEventPoster;
    use crate::report::DeadDeliveryReport;
    use crate::repository::{MockDeadDeliveryReportRepository, MockTerminalStateLookup};
    use mockall::predicate::eq;
    use notify_shared::error::NotifyError;

    fn settings() -> ReplaySettings {
        ReplaySettings {
            from_id: 100,
            to_id: 200,
            reason: "RETRY_THRESHOLD_EXCEEDED".to_string(),
            channel: DeliveryReportChannel::AzureCommunicationServices,
            post_delay: Duration::from_millis(1),
        }
    }

    fn report(id: i64, payload: &str) -> DeadDeliveryReport {
        DeadDeliveryReport {
            id,
            channel: DeliveryReportChannel::AzureCommunicationServices,
            attempt_count: 3,
            delivery_report: payload.to_string(),
            resolved: false,
            first_seen: Utc::now(),
            last_attempt: Utc::now(),
            reason: "RETRY_THRESHOLD_EXCEEDED".to_string(),
        }
    }

    fn repository_returning(reports: Vec<DeadDeliveryReport>) -> MockDeadDeliveryReportRepository {
        let mut repository = MockDeadDeliveryReportRepository::new();
        repository
            .expect_get_dead_delivery_reports()
            .withf(|from, to, reason, channel| {
                *from == 100
                    && *to == 200
                    && reason == "RETRY_THRESHOLD_EXCEEDED"
                    && *channel == DeliveryReportChannel::AzureCommunicationServices
            })
            .times(1)
            .returning(move |_, _, _, _| Ok(reports.clone()));
        repository
    }

    #[tokio::test]
    async fn test_resolved_report_is_not_posted() {
        let repository = repository_returning(vec![report(
            101,
            r#"{"operationId":"op-done","sendResult":"Failed_Bounced"}"#,
        )]);
        let mut lookup = MockTerminalStateLookup::new();
        lookup
            .expect_is_notification_in_terminal_success_state()
            .with(eq("op-done"))
            .times(1)
            .returning(|_| Ok(true));
        let mut poster = MockEventPoster::new();
        poster.expect_post().never();

        let summary = DeadLetterReplayer::new(
            Arc::new(repository),
            Arc::new(lookup),
            Arc::new(poster),
            settings(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.skipped_resolved, 1);
        assert_eq!(summary.posted, 0);
    }

    #[tokio::test]
    async fn test_unparseable_report_is_skipped_and_batch_continues() {
        let repository = repository_returning(vec![
            report(101, "not json"),
            report(102, r#"{"operationId":"op-x","sendResult":"Failed_Teleported"}"#),
            report(103, r#"{"operationId":"op-2","sendResult":"Failed_SupressedRecipient"}"#),
        ]);
        let mut lookup = MockTerminalStateLookup::new();
        lookup
            .expect_is_notification_in_terminal_success_state()
            .with(eq("op-2"))
            .times(1)
            .returning(|_| Ok(false));
        let mut poster = MockEventPoster::new();
        poster
            .expect_post()
            .withf(|event| event.data.message_id == "op-2" && event.data.status == "Suppressed")
            .times(1)
            .returning(|_| Ok(()));

        let summary = DeadLetterReplayer::new(
            Arc::new(repository),
            Arc::new(lookup),
            Arc::new(poster),
            settings(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                fetched: 3,
                skipped_unparseable: 2,
                skipped_resolved: 0,
                posted: 1,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_post_failure_does_not_stop_batch() {
        let repository = repository_returning(vec![
            report(101, r#"{"operationId":"op-1","sendResult":"Failed"}"#),
            report(102, r#"{"operationId":"op-2","sendResult":"Delivered"}"#),
        ]);
        let mut lookup = MockTerminalStateLookup::new();
        lookup
            .expect_is_notification_in_terminal_success_state()
            .returning(|_| Ok(false));
        let mut poster = MockEventPoster::new();
        poster
            .expect_post()
            .withf(|event| event.data.message_id == "op-1")
            .times(1)
            .returning(|_| {
                Err(ReplayError::Rejected {
                    status: 503,
                    body: "busy".to_string(),
                })
            });
        poster
            .expect_post()
            .withf(|event| event.data.message_id == "op-2")
            .times(1)
            .returning(|_| Ok(()));

        let summary = DeadLetterReplayer::new(
            Arc::new(repository),
            Arc::new(lookup),
            Arc::new(poster),
            settings(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.posted, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_escapes_batch() {
        let mut repository = MockDeadDeliveryReportRepository::new();
        repository
            .expect_get_dead_delivery_reports()
            .returning(|_, _, _, _| Err(NotifyError::Internal("连接中断".to_string()).into()));

        let result = DeadLetterReplayer::new(
            Arc::new(repository),
            Arc::new(MockTerminalStateLookup::new()),
            Arc::new(MockEventPoster::new()),
            settings(),
        )
        .run()
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sms_channel_is_rejected_before_fetch() {
        let mut repository = MockDeadDeliveryReportRepository::new();
        repository.expect_get_dead_delivery_reports().never();
        let mut poster = MockEventPoster::new();
        poster.expect_post().never();

        let result = DeadLetterReplayer::new(
            Arc::new(repository),
            Arc::new(MockTerminalStateLookup::new()),
            Arc::new(poster),
            ReplaySettings {
                channel: DeliveryReportChannel::LinkMobility,
                ..settings()
            },
        )
        .run()
        .await;

        assert!(matches!(result, Err(ReplayError::InvalidSettings(_))));
    }

    #[test]
    fn test_validate_rejects_empty_range() {
        let empty = ReplaySettings {
            from_id: 200,
            to_id: 200,
            ..settings()
        };
        assert!(matches!(empty.validate(), Err(ReplayError::InvalidSettings(_))));
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_settings_from_config() {
        let config = ReplayConfig {
            from_id: 5,
            to_id: 9,
            post_delay_ms: 250,
            ..Default::default()
        };
        let settings = ReplaySettings::from(&config);
        assert_eq!(settings.from_id, 5);
        assert_eq!(settings.to_id, 9);
        assert_eq!(settings.post_delay, Duration::from_millis(250));
        assert_eq!(settings.reason, "RETRY_THRESHOLD_EXCEEDED");
    }
}
