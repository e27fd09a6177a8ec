//! 订单处理协作方边界
//!
//! 真正的订单处理（接收人解析、模板渲染、渠道分发）在外部服务中完成。
//! 消费者只依赖 `OrderProcessor`，同一订单可能被重复投递，实现方必须按订单 id 幂等。

use async_trait::async_trait;
use notify_shared::events::{NotificationOrder, NotificationTemplate};
use tracing::info;

use crate::error::OrderWorkerError;

/// 订单处理协作方
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderProcessor: Send + Sync {
    async fn process_order(&self, order: &NotificationOrder) -> Result<(), OrderWorkerError>;
}

/// 只记录订单概要的处理器
///
/// 本进程不承担订单的业务处理，部署时由外部服务替换。没有接收人的订单视为无效。
#[derive(Debug, Default)]
pub struct LoggingOrderProcessor;

#[async_trait]
impl OrderProcessor for LoggingOrderProcessor {
    async fn process_order(&self, order: &NotificationOrder) -> Result<(), OrderWorkerError> {
        if order.recipients.is_empty() {
            return Err(OrderWorkerError::Processing {
                order_id: order.id,
                reason: "订单没有接收人".to_string(),
            });
        }

        let email_templates = order
            .templates
            .iter()
            .filter(|t| matches!(t, NotificationTemplate::Email { .. }))
            .count();
        let sms_templates = order.templates.len() - email_templates;

        info!(
            order_id = %order.id,
            creator = %order.creator,
            channel = ?order.notification_channel,
            policy = %order.sending_time_policy,
            recipients = order.recipients.len(),
            email_templates,
            sms_templates,
            "订单已交付处理"
        );
        Ok(())
    }
}
