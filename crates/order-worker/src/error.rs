//! 订单 worker 专用错误类型

use notify_shared::error::NotifyError;
use uuid::Uuid;

use crate::consumer::ConsumerState;

/// 订单 worker 错误
#[derive(Debug, thiserror::Error)]
pub enum OrderWorkerError {
    /// 订单处理协作方拒绝或处理失败
    #[error("订单处理失败: {order_id} - {reason}")]
    Processing { order_id: Uuid, reason: String },

    /// 在不允许的状态下启动或停止消费者
    #[error("消费者状态不允许该操作: 期望 {expected:?}，实际 {actual:?}")]
    InvalidState {
        expected: ConsumerState,
        actual: ConsumerState,
    },

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

impl OrderWorkerError {
    /// 取消是正常停止信号
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Shared(e) if e.is_cancelled())
    }
}
