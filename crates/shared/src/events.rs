//! 通知管道的领域模型
//!
//! 定义在 broker 上传输的通知订单、调度策略、渠道选择，以及死信回执中
//! 内嵌的渠道发送结果。所有模型均以 camelCase JSON 序列化，与上下游保持一致。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::EmailLifecycle;

// ---------------------------------------------------------------------------
// SendingTimePolicy：发送时间策略
// ---------------------------------------------------------------------------

/// 发送时间策略
///
/// 决定订单允许在哪个时间窗口内投递，同时作为合并信号的调度键。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendingTimePolicy {
    /// 任意时间发送
    #[default]
    Anytime,
    /// 仅在白天窗口内发送
    Daytime,
}

impl SendingTimePolicy {
    /// 全部已知策略，用于构造分区信号
    pub const ALL: [SendingTimePolicy; 2] = [Self::Anytime, Self::Daytime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anytime => "Anytime",
            Self::Daytime => "Daytime",
        }
    }
}

impl std::fmt::Display for SendingTimePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// NotificationChannel：渠道选择
// ---------------------------------------------------------------------------

/// 订单的渠道选择器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationChannel {
    Email,
    Sms,
    EmailPreferred,
    SmsPreferred,
    EmailAndSms,
}

// ---------------------------------------------------------------------------
// NotificationOrder：通知订单
// ---------------------------------------------------------------------------

/// 订单接收人
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_identity_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_number: Option<String>,
}

/// 渠道模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationTemplate {
    #[serde(rename_all = "camelCase")]
    Email {
        from_address: String,
        subject: String,
        body: String,
        content_type: String,
    },
    #[serde(rename_all = "camelCase")]
    Sms { sender_number: String, body: String },
}

/// 通知订单
///
/// 由上游协作方生产，序列化后发布到逾期订单 topic，
/// OrderConsumer 反序列化后交给订单处理协作方。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOrder {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders_reference: Option<String>,
    pub creator: String,
    pub requested_send_time: DateTime<Utc>,
    pub notification_channel: NotificationChannel,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub templates: Vec<NotificationTemplate>,
    #[serde(default)]
    pub sending_time_policy: SendingTimePolicy,
    pub created: DateTime<Utc>,
}

impl NotificationOrder {
    /// broker 消息键：同一订单的消息总是落在同一分区
    pub fn message_key(&self) -> String {
        self.id.to_string()
    }
}

// ---------------------------------------------------------------------------
// 死信回执
// ---------------------------------------------------------------------------

/// 回执来源渠道
///
/// 数据库以 smallint 存储：0 = Azure Communication Services（邮件），1 = LINK Mobility（短信）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryReportChannel {
    #[default]
    AzureCommunicationServices,
    LinkMobility,
}

impl DeliveryReportChannel {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::AzureCommunicationServices => 0,
            Self::LinkMobility => 1,
        }
    }
}

impl TryFrom<i16> for DeliveryReportChannel {
    type Error = crate::error::NotifyError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AzureCommunicationServices),
            1 => Ok(Self::LinkMobility),
            other => Err(crate::error::NotifyError::Internal(format!(
                "未知的回执渠道: {other}"
            ))),
        }
    }
}

/// 死信回执中内嵌的邮件发送结果
///
/// `send_result` 经生命周期映射器解析，未知状态码会让整条回执反序列化失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendOperationResult {
    #[serde(default)]
    pub notification_id: Option<Uuid>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub send_result: Option<EmailLifecycle>,
}
