//! 回放批处理专用错误类型

use notify_shared::error::NotifyError;

/// 回放错误
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// 事件入口返回非成功状态码
    #[error("事件投递被拒绝: HTTP {status} - {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    /// 回执缺少回放所需的字段
    #[error("回执 {report_id} 不完整: 缺少 {field}")]
    IncompleteReport { report_id: i64, field: &'static str },

    /// 回放范围或渠道不可用，批处理不会启动
    #[error("回放参数无效: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Shared(#[from] NotifyError),
}

impl From<sqlx::Error> for ReplayError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(NotifyError::Database(err))
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(NotifyError::Serialization(err))
    }
}
