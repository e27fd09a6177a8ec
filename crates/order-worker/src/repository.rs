//! 逾期订单存储
//!
//! 认领使用 `FOR UPDATE SKIP LOCKED`，多实例并发认领同一策略时不会拿到同一订单。
//! 认领与退回都以 `alternate_id`（即订单负载中的 `id`）定位行。

use async_trait::async_trait;
use notify_shared::error::Result;
use notify_shared::events::{NotificationOrder, SendingTimePolicy};
use notify_shared::lifecycle::OrderLifecycle;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

/// 逾期订单存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PastDueOrderRepository: Send + Sync {
    /// 认领指定策略下已到发送时间的订单，状态由 Registered 变为 Processing
    async fn claim_past_due(
        &self,
        policy: SendingTimePolicy,
        limit: i64,
    ) -> Result<Vec<NotificationOrder>>;

    /// 发布失败的订单退回 Registered，等待下一轮认领
    async fn release(&self, order_ids: &[Uuid]) -> Result<u64>;
}

/// 认领到期订单，并返回订单负载
const CLAIM_PAST_DUE_SQL: &str = r#"
    WITH claimable AS (
        SELECT alternate_id
        FROM notifications.orders
        WHERE processed_status = $1
          AND sending_time_policy = $2
          AND requested_send_time <= NOW()
        ORDER BY requested_send_time ASC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    UPDATE notifications.orders o
    SET processed_status = $4, processed_at = NOW()
    FROM claimable
    WHERE o.alternate_id = claimable.alternate_id
    RETURNING o.order_payload
"#;

/// 把仍处于 Processing 的订单退回 Registered
const RELEASE_SQL: &str = r#"
    UPDATE notifications.orders
    SET processed_status = $1, processed_at = NULL
    WHERE alternate_id = ANY($2) AND processed_status = $3
"#;

/// PostgreSQL 实现
pub struct PgPastDueOrderRepository {
    pool: PgPool,
}

impl PgPastDueOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PastDueOrderRepository for PgPastDueOrderRepository {
    async fn claim_past_due(
        &self,
        policy: SendingTimePolicy,
        limit: i64,
    ) -> Result<Vec<NotificationOrder>> {
        let rows: Vec<(Json<NotificationOrder>,)> = sqlx::query_as(CLAIM_PAST_DUE_SQL)
            .bind(OrderLifecycle::Registered.as_str())
            .bind(policy.as_str())
            .bind(limit)
            .bind(OrderLifecycle::Processing.as_str())
            .fetch_all(&self.pool)
            .await?;

        debug!(policy = %policy, claimed = rows.len(), "已认领逾期订单");
        Ok(rows.into_iter().map(|(Json(order),)| order).collect())
    }

    async fn release(&self, order_ids: &[Uuid]) -> Result<u64> {
        if order_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(RELEASE_SQL)
            .bind(OrderLifecycle::Registered.as_str())
            .bind(order_ids)
            .bind(OrderLifecycle::Processing.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
