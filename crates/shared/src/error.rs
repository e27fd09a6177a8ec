//! 统一错误处理模块
//!
//! 定义通知管道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 预期内的失败（合并未命中、发布失败）以返回值表达，不进入此枚举。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    /// 启动阶段创建 topic 失败，属于致命错误，服务必须中止启动
    #[error("创建 topic 失败: {topic} - {reason}")]
    TopicProvisioning { topic: String, reason: String },

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 生命周期映射错误 ====================
    /// 存储中的状态码与代码中的枚举不一致，必须立即暴露而非降级
    #[error("未知的{kind}状态: {value}")]
    UnknownLifecycleStatus { kind: &'static str, value: String },

    #[error("{kind}状态为空")]
    BlankLifecycleStatus { kind: &'static str },

    // ==================== 调度信号错误 ====================
    #[error("未注册的调度键: {key}")]
    UnknownSchedulingKey { key: String },

    /// 取消是正常停止信号，调用方应静默退出而非记录为错误
    #[error("操作已取消")]
    Cancelled,

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::TopicProvisioning { .. } => "TOPIC_PROVISIONING_FAILED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::UnknownLifecycleStatus { .. } => "UNKNOWN_LIFECYCLE_STATUS",
            Self::BlankLifecycleStatus { .. } => "BLANK_LIFECYCLE_STATUS",
            Self::UnknownSchedulingKey { .. } => "UNKNOWN_SCHEDULING_KEY",
            Self::Cancelled => "CANCELLED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_))
    }

    /// 是否为取消信号
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
