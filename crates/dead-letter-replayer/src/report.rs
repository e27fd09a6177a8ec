//! 死信回执模型

use chrono::{DateTime, Utc};
use notify_shared::events::{DeliveryReportChannel, EmailSendOperationResult};
use notify_shared::lifecycle::EmailLifecycle;
use uuid::Uuid;

use crate::error::ReplayError;

/// 一条死信回执
///
/// 由正常流水线在重试耗尽后写入；回放批处理只读不写，解决状态由下游在重新投递后更新。
#[derive(Debug, Clone, PartialEq)]
pub struct DeadDeliveryReport {
    pub id: i64,
    pub channel: DeliveryReportChannel,
    pub attempt_count: i32,
    /// 序列化的渠道发送结果
    pub delivery_report: String,
    pub resolved: bool,
    pub first_seen: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub reason: String,
}

/// 可以回放的邮件结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayCandidate {
    pub report_id: i64,
    pub notification_id: Option<Uuid>,
    pub operation_id: String,
    pub status: EmailLifecycle,
}

impl DeadDeliveryReport {
    /// 解析内嵌的邮件发送结果
    ///
    /// JSON 无效、状态码未知，或缺少 operationId / sendResult 时返回错误。
    pub fn parse_email_result(&self) -> Result<ReplayCandidate, ReplayError> {
        let result: EmailSendOperationResult = serde_json::from_str(&self.delivery_report)?;

        let operation_id = result
            .operation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ReplayError::IncompleteReport {
                report_id: self.id,
                field: "operationId",
            })?;
        let status = result.send_result.ok_or(ReplayError::IncompleteReport {
            report_id: self.id,
            field: "sendResult",
        })?;

        Ok(ReplayCandidate {
            report_id: self.id,
            notification_id: result.notification_id,
            operation_id,
            status,
        })
    }
}

/// 内部结果码转换为外部回执词汇
///
/// 除少数改名外原样透传。
pub fn to_external_status(status: EmailLifecycle) -> &'static str {
    match status {
        EmailLifecycle::FailedBounced => "Bounced",
        EmailLifecycle::FailedSupressedRecipient => "Suppressed",
        EmailLifecycle::FailedQuarantined => "Quarantined",
        EmailLifecycle::FailedFilteredSpam => "FilteredSpam",
        other => other.as_str(),
    }
}
