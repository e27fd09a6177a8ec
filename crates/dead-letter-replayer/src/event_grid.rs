//! Event Grid 事件投递
//!
//! 每次 POST 的请求体是只含一个事件的 JSON 数组，通过 `aeg-sas-key` 头鉴权。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::ReplayError;

/// 邮件送达回执的事件类型
pub const EMAIL_DELIVERY_REPORT_EVENT_TYPE: &str =
    "Microsoft.Communication.EmailDeliveryReportReceived";

const SAS_KEY_HEADER: &str = "aeg-sas-key";

/// 回执数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReportData {
    pub message_id: String,
    pub status: String,
}

/// Event Grid 事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGridEvent {
    pub id: String,
    pub subject: String,
    pub event_type: String,
    pub data_version: String,
    pub data: DeliveryReportData,
    pub event_time: DateTime<Utc>,
}

impl EventGridEvent {
    /// 构造一条邮件送达回执事件
    pub fn delivery_report(operation_id: &str, status: &str, now: DateTime<Utc>) -> Self {
        let subject = format!("sender/senderid@azure.com/message/{operation_id}");
        Self {
            id: subject.clone(),
            subject,
            event_type: EMAIL_DELIVERY_REPORT_EVENT_TYPE.to_string(),
            data_version: "1.0".to_string(),
            data: DeliveryReportData {
                message_id: operation_id.to_string(),
                status: status.to_string(),
            },
            event_time: now,
        }
    }
}

/// 事件投递接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPoster: Send + Sync {
    async fn post(&self, event: &EventGridEvent) -> Result<(), ReplayError>;
}

/// 基于 reqwest 的实现
pub struct HttpEventPoster {
    client: reqwest::Client,
    endpoint: String,
    access_key: String,
}

impl HttpEventPoster {
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ReplayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            access_key: access_key.into(),
        })
    }
}

#[async_trait]
impl EventPoster for HttpEventPoster {
    async fn post(&self, event: &EventGridEvent) -> Result<(), ReplayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(SAS_KEY_HEADER, &self.access_key)
            .json(&[event])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(event_id = %event.id, status = status.as_u16(), "事件已投递");
        Ok(())
    }
}
