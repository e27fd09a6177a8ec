//! 回放所需的存储协作方
//!
//! - `DeadDeliveryReportRepository`：按 ID 区间、原因标记与渠道读取死信回执
//! - `TerminalStateLookup`：判断通知是否已处于未过期的成功终态

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::events::DeliveryReportChannel;
use notify_shared::lifecycle::EmailLifecycle;
use sqlx::PgPool;

use crate::error::ReplayError;
use crate::report::DeadDeliveryReport;

/// 死信回执读取接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadDeliveryReportRepository: Send + Sync {
    /// 读取 `[from_id, to_id)` 内匹配原因与渠道的回执，按 ID 升序
    async fn get_dead_delivery_reports(
        &self,
        from_id: i64,
        to_id: i64,
        reason: &str,
        channel: DeliveryReportChannel,
    ) -> Result<Vec<DeadDeliveryReport>, ReplayError>;
}

/// 终态查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TerminalStateLookup: Send + Sync {
    /// 该操作对应的通知是否已记录为成功且尚未过期
    async fn is_notification_in_terminal_success_state(
        &self,
        operation_id: &str,
    ) -> Result<bool, ReplayError>;
}

// ---------------------------------------------------------------------------
// PostgreSQL 实现
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct DeadDeliveryReportRow {
    id: i64,
    channel: i16,
    attempt_count: i32,
    delivery_report: String,
    resolved: bool,
    first_seen: DateTime<Utc>,
    last_attempt: DateTime<Utc>,
    reason: String,
}

impl TryFrom<DeadDeliveryReportRow> for DeadDeliveryReport {
    type Error = ReplayError;

    fn try_from(row: DeadDeliveryReportRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            channel: DeliveryReportChannel::try_from(row.channel)?,
            attempt_count: row.attempt_count,
            delivery_report: row.delivery_report,
            resolved: row.resolved,
            first_seen: row.first_seen,
            last_attempt: row.last_attempt,
            reason: row.reason,
        })
    }
}

pub struct PgDeadDeliveryReportRepository {
    pool: PgPool,
}

impl PgDeadDeliveryReportRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadDeliveryReportRepository for PgDeadDeliveryReportRepository {
    async fn get_dead_delivery_reports(
        &self,
        from_id: i64,
        to_id: i64,
        reason: &str,
        channel: DeliveryReportChannel,
    ) -> Result<Vec<DeadDeliveryReport>, ReplayError> {
        let rows = sqlx::query_as::<_, DeadDeliveryReportRow>(
            r#"
            SELECT id, channel, attempt_count, delivery_report::text AS delivery_report,
                   resolved, first_seen, last_attempt, reason
            FROM notifications.dead_delivery_reports
            WHERE id >= $1
              AND id < $2
              AND reason = $3
              AND channel = $4
            ORDER BY id ASC
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .bind(reason)
        .bind(channel.as_i16())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadDeliveryReport::try_from).collect()
    }
}

pub struct PgTerminalStateLookup {
    pool: PgPool,
}

impl PgTerminalStateLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TerminalStateLookup for PgTerminalStateLookup {
    async fn is_notification_in_terminal_success_state(
        &self,
        operation_id: &str,
    ) -> Result<bool, ReplayError> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM notifications.email_notifications
                WHERE operation_id = $1
                  AND result = $2
                  AND expiry_time > NOW()
            )
            "#,
        )
        .bind(operation_id)
        .bind(EmailLifecycle::Succeeded.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }
}
